// ABOUTME: Lookup-table routing: maps a row's key column to target external ids via a table
// ABOUTME: The table is read once per routing pass and cached in the router context

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use change_log::Change;
use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, RouteError};
use crate::model::Node;
use crate::utils::{quote_ident, validate_identifier};

/// Key value to the external ids it routes to.
pub type LookupSnapshot = HashMap<String, Vec<String>>;

/// Where lookup tables are read from.
pub trait LookupSource: Send + Sync {
    fn load(&self, table: &LookupTableSettings) -> Result<LookupSnapshot>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupTableSettings {
    pub lookup_table: String,
    /// Column of the captured row holding the key.
    pub key_column: String,
    /// Column of the lookup table matched against the key.
    pub lookup_key_column: String,
    pub external_id_column: String,
}

impl LookupTableSettings {
    /// Parses `KEY=VALUE` lines; all four keys are required.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for line in expression.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                RouteError::config("lookup table", format!("expected KEY=VALUE, got '{line}'"))
            })?;
            entries.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
        }
        let mut take = |key: &str| -> Result<String> {
            let value = entries
                .remove(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RouteError::config("lookup table", format!("missing {key}")))?;
            validate_identifier(&value)
                .map_err(|e| RouteError::config("lookup table", format!("{key}: {e}")))?;
            Ok(value)
        };
        Ok(Self {
            lookup_table: take("LOOKUP_TABLE")?,
            key_column: take("KEY_COLUMN")?,
            lookup_key_column: take("LOOKUP_KEY_COLUMN")?,
            external_id_column: take("EXTERNAL_ID_COLUMN")?,
        })
    }

    pub fn evaluate(
        &self,
        change: &Change,
        candidates: &[Node],
        snapshot: &LookupSnapshot,
    ) -> BTreeSet<String> {
        let Some(key) = change.value(&self.key_column) else {
            return BTreeSet::new();
        };
        let Some(external_ids) = snapshot.get(key) else {
            return BTreeSet::new();
        };
        candidates
            .iter()
            .filter(|n| external_ids.contains(&n.external_id))
            .map(|n| n.node_id.clone())
            .collect()
    }
}

/// Reads lookup tables from a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLookupSource {
    path: PathBuf,
}

impl SqliteLookupSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LookupSource for SqliteLookupSource {
    fn load(&self, table: &LookupTableSettings) -> Result<LookupSnapshot> {
        let unavailable = |e: rusqlite::Error| {
            RouteError::Transient(format!(
                "lookup table {} unavailable: {e}",
                table.lookup_table
            ))
        };
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;
        let sql = format!(
            "SELECT {}, {} FROM {}",
            quote_ident(&table.lookup_key_column),
            quote_ident(&table.external_id_column),
            quote_ident(&table.lookup_table)
        );
        let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
        let mut rows = stmt.query([]).map_err(unavailable)?;
        let mut snapshot = LookupSnapshot::new();
        while let Some(row) = rows.next().map_err(unavailable)? {
            let key: Option<String> = row.get(0).map_err(unavailable)?;
            let external: Option<String> = row.get(1).map_err(unavailable)?;
            if let (Some(key), Some(external)) = (key, external) {
                snapshot.entry(key).or_default().push(external);
            }
        }
        tracing::debug!(
            table = %table.lookup_table,
            keys = snapshot.len(),
            "loaded lookup table"
        );
        Ok(snapshot)
    }
}
