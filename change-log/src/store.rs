use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::change::{Change, EventType, NewChange, RowValues, TableDef, TableRef};
use crate::dialect::DialectCapabilities;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trigger_hist (
    trigger_hist_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name        TEXT NOT NULL,
    column_names      TEXT NOT NULL,
    pk_column_names   TEXT NOT NULL,
    create_time       TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS captured_data (
    data_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger_hist_id  INTEGER NOT NULL REFERENCES trigger_hist(trigger_hist_id),
    event_type       TEXT NOT NULL,
    row_data         TEXT,
    old_data         TEXT,
    pk_data          TEXT,
    channel_id       TEXT NOT NULL,
    transaction_id   TEXT,
    source_node_id   TEXT,
    create_time      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS captured_data_channel ON captured_data(channel_id, data_id);
"#;

const SELECT_COLUMNS: &str = "data_id, trigger_hist_id, event_type, row_data, old_data, pk_data, \
     channel_id, transaction_id, source_node_id, create_time";

/// Which sequence ids a scan may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdFilter {
    /// Inclusive `(start, end)` ranges.
    Ranges(Vec<(i64, i64)>),
    AtLeast(i64),
}

/// One keyset page over the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub filter: IdFilter,
    /// Only rows with a sequence id strictly greater than this are returned.
    pub after_id: i64,
    pub limit: usize,
}

/// Append-only store of captured changes and the table layouts they refer to.
pub struct ChangeLogStore {
    conn: Connection,
    capabilities: DialectCapabilities,
    tables: RefCell<HashMap<i64, Arc<TableRef>>>,
}

impl ChangeLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create change log directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open change log {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set change log busy timeout")?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for change log")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.execute_batch(SCHEMA)
            .context("failed to initialize change log schema")?;
        Ok(Self {
            conn,
            capabilities: DialectCapabilities::sqlite(),
            tables: RefCell::new(HashMap::new()),
        })
    }

    pub fn with_capabilities(mut self, capabilities: DialectCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn capabilities(&self) -> &DialectCapabilities {
        &self.capabilities
    }

    /// Records a table layout. An identical layout reuses its existing history id.
    pub fn register_table(&self, def: &TableDef) -> Result<i64> {
        let columns = serde_json::to_string(&def.columns)?;
        let pk_columns = serde_json::to_string(&def.pk_columns)?;
        let existing = self
            .conn
            .query_row(
                "SELECT trigger_hist_id FROM trigger_hist
                 WHERE table_name = ?1 AND column_names = ?2 AND pk_column_names = ?3
                 ORDER BY trigger_hist_id DESC LIMIT 1",
                params![def.table_name, columns, pk_columns],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO trigger_hist(table_name, column_names, pk_column_names) VALUES (?1, ?2, ?3)",
            params![def.table_name, columns, pk_columns],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(table = %def.table_name, trigger_hist_id = id, "registered table layout");
        Ok(id)
    }

    pub fn table_ref(&self, trigger_hist_id: i64) -> Result<Arc<TableRef>> {
        if let Some(table) = self.tables.borrow().get(&trigger_hist_id) {
            return Ok(Arc::clone(table));
        }
        let (table_name, columns, pk_columns): (String, String, String) = self
            .conn
            .query_row(
                "SELECT table_name, column_names, pk_column_names
                 FROM trigger_hist WHERE trigger_hist_id = ?1",
                [trigger_hist_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("unknown trigger history id {trigger_hist_id}"))?;
        let table = Arc::new(TableRef {
            trigger_hist_id,
            def: TableDef {
                table_name,
                columns: serde_json::from_str(&columns)
                    .context("corrupt column list in trigger history")?,
                pk_columns: serde_json::from_str(&pk_columns)
                    .context("corrupt primary key list in trigger history")?,
            },
        });
        self.tables
            .borrow_mut()
            .insert(trigger_hist_id, Arc::clone(&table));
        Ok(table)
    }

    pub fn append(&self, change: &NewChange) -> Result<i64> {
        self.insert(None, change)
    }

    /// Appends with a sequence id issued earlier, as a slow writer committing late would.
    pub fn append_with_id(&self, sequence_id: i64, change: &NewChange) -> Result<i64> {
        self.insert(Some(sequence_id), change)
    }

    fn insert(&self, sequence_id: Option<i64>, change: &NewChange) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO captured_data(data_id, trigger_hist_id, event_type, row_data, old_data,
                 pk_data, channel_id, transaction_id, source_node_id, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                sequence_id,
                change.trigger_hist_id,
                change.event_type.code(),
                encode(&change.row_data)?,
                encode(&change.old_data)?,
                encode(&change.pk_data)?,
                change.channel_id,
                change.transaction_id,
                change.source_node_id,
                Utc::now(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_in_range(&self, start_id: i64, end_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM captured_data WHERE data_id BETWEEN ?1 AND ?2",
            [start_id, end_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Fetches one page of changes in ascending sequence id order.
    pub fn fetch(&self, query: &LogQuery) -> Result<Vec<Change>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM captured_data WHERE data_id > ?");
        let mut values: Vec<i64> = vec![query.after_id];
        match &query.filter {
            IdFilter::Ranges(ranges) => {
                if ranges.is_empty() {
                    return Ok(Vec::new());
                }
                if ranges.len() > self.capabilities.max_id_ranges() {
                    bail!(
                        "{} id ranges exceed the {} dialect limit of {}",
                        ranges.len(),
                        self.capabilities.name,
                        self.capabilities.max_id_ranges()
                    );
                }
                let clauses = vec!["data_id BETWEEN ? AND ?"; ranges.len()].join(" OR ");
                sql.push_str(&format!(" AND ({clauses})"));
                for (start, end) in ranges {
                    values.push(*start);
                    values.push(*end);
                }
            }
            IdFilter::AtLeast(start) => {
                sql.push_str(" AND data_id >= ?");
                values.push(*start);
            }
        }
        sql.push_str(" ORDER BY data_id ASC LIMIT ?");
        values.push(query.limit as i64);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let trigger_hist_id: i64 = row.get(1)?;
            let event_code: String = row.get(2)?;
            let captured_at: DateTime<Utc> = row.get(9)?;
            out.push(Change {
                sequence_id: row.get(0)?,
                table: self.table_ref(trigger_hist_id)?,
                event_type: EventType::from_code(&event_code)?,
                row_data: decode(row.get(3)?)?,
                old_data: decode(row.get(4)?)?,
                pk_data: decode(row.get(5)?)?,
                channel_id: row.get(6)?,
                transaction_id: row.get(7)?,
                source_node_id: row.get(8)?,
                captured_at,
            });
        }
        Ok(out)
    }

    pub fn get(&self, sequence_id: i64) -> Result<Option<Change>> {
        let mut page = self.fetch(&LogQuery {
            filter: IdFilter::Ranges(vec![(sequence_id, sequence_id)]),
            after_id: sequence_id - 1,
            limit: 1,
        })?;
        Ok(page.pop())
    }
}

fn encode(values: &Option<RowValues>) -> Result<Option<String>> {
    values
        .as_ref()
        .map(|v| serde_json::to_string(v).context("failed to encode row payload"))
        .transpose()
}

fn decode(raw: Option<String>) -> Result<Option<RowValues>> {
    raw.map(|text| serde_json::from_str(&text).context("corrupt row payload"))
        .transpose()
}
