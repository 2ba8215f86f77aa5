use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    Reload,
    Sql,
}

impl EventType {
    pub fn code(&self) -> &'static str {
        match self {
            EventType::Insert => "I",
            EventType::Update => "U",
            EventType::Delete => "D",
            EventType::Reload => "R",
            EventType::Sql => "S",
        }
    }

    pub fn from_code(value: &str) -> Result<Self> {
        match value {
            "I" => Ok(EventType::Insert),
            "U" => Ok(EventType::Update),
            "D" => Ok(EventType::Delete),
            "R" => Ok(EventType::Reload),
            "S" => Ok(EventType::Sql),
            other => Err(anyhow!("unknown event type code: {other}")),
        }
    }

    /// Whether the row carries a pre-image.
    pub fn has_old_values(&self) -> bool {
        matches!(self, EventType::Update | EventType::Delete)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Table layout as registered by the capture layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub table_name: String,
    pub columns: Vec<String>,
    pub pk_columns: Vec<String>,
}

impl TableDef {
    pub fn new(table_name: &str, columns: &[&str], pk_columns: &[&str]) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            pk_columns: pk_columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// A table layout pinned to the trigger history row that was active at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub trigger_hist_id: i64,
    pub def: TableDef,
}

impl TableRef {
    pub fn table_name(&self) -> &str {
        &self.def.table_name
    }

    /// Case-insensitive column position.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.def
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }
}

pub type RowValues = Vec<Option<String>>;

#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub trigger_hist_id: i64,
    pub event_type: EventType,
    pub row_data: Option<RowValues>,
    pub old_data: Option<RowValues>,
    pub pk_data: Option<RowValues>,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    pub source_node_id: Option<String>,
}

impl NewChange {
    pub fn insert(trigger_hist_id: i64, channel_id: &str, row: &[Option<&str>]) -> Self {
        Self {
            trigger_hist_id,
            event_type: EventType::Insert,
            row_data: Some(to_values(row)),
            old_data: None,
            pk_data: None,
            channel_id: channel_id.to_string(),
            transaction_id: None,
            source_node_id: None,
        }
    }

    pub fn with_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    pub fn with_old_data(mut self, event_type: EventType, old: &[Option<&str>]) -> Self {
        self.event_type = event_type;
        self.old_data = Some(to_values(old));
        self
    }

    pub fn from_node(mut self, node_id: &str) -> Self {
        self.source_node_id = Some(node_id.to_string());
        self
    }
}

fn to_values(row: &[Option<&str>]) -> RowValues {
    row.iter().map(|v| v.map(str::to_string)).collect()
}

/// A captured row change. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub sequence_id: i64,
    pub table: Arc<TableRef>,
    pub event_type: EventType,
    pub row_data: Option<RowValues>,
    pub old_data: Option<RowValues>,
    pub pk_data: Option<RowValues>,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    pub source_node_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Change {
    /// Current value of a column: the post-image, or the pre-image for deletes.
    pub fn value(&self, column: &str) -> Option<&str> {
        let idx = self.table.column_index(column)?;
        let row = match (self.event_type, &self.row_data) {
            (EventType::Delete, _) | (_, None) => self.old_data.as_ref().or(self.pk_data.as_ref()),
            (_, Some(row)) => Some(row),
        }?;
        row.get(idx)?.as_deref()
    }

    pub fn old_value(&self, column: &str) -> Option<&str> {
        let idx = self.table.column_index(column)?;
        self.old_data.as_ref()?.get(idx)?.as_deref()
    }

    /// Whether the column exists in the captured layout.
    pub fn has_column(&self, column: &str) -> bool {
        self.table.column_index(column).is_some()
    }

    /// Approximate serialized size, used for batch byte thresholds.
    pub fn estimated_bytes(&self) -> u64 {
        fn size(values: &Option<RowValues>) -> u64 {
            values
                .as_ref()
                .map(|row| {
                    row.iter()
                        .map(|v| v.as_ref().map(|s| s.len() as u64 + 3).unwrap_or(4) + 1)
                        .sum()
                })
                .unwrap_or(0)
        }
        size(&self.row_data) + size(&self.old_data) + size(&self.pk_data) + 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Arc<TableRef> {
        Arc::new(TableRef {
            trigger_hist_id: 1,
            def: TableDef::new("orders", &["id", "status"], &["id"]),
        })
    }

    fn change(event_type: EventType) -> Change {
        Change {
            sequence_id: 7,
            table: orders(),
            event_type,
            row_data: Some(vec![Some("1".into()), Some("ACTIVE".into())]),
            old_data: Some(vec![Some("1".into()), Some("PENDING".into())]),
            pk_data: None,
            channel_id: "default".into(),
            transaction_id: None,
            source_node_id: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn value_reads_post_image_with_case_insensitive_columns() {
        let c = change(EventType::Update);
        assert_eq!(c.value("STATUS"), Some("ACTIVE"));
        assert_eq!(c.old_value("status"), Some("PENDING"));
        assert_eq!(c.value("missing"), None);
    }

    #[test]
    fn delete_reads_pre_image() {
        let c = change(EventType::Delete);
        assert_eq!(c.value("status"), Some("PENDING"));
    }

    #[test]
    fn event_codes_are_stable() {
        for event in [
            EventType::Insert,
            EventType::Update,
            EventType::Delete,
            EventType::Reload,
            EventType::Sql,
        ] {
            assert_eq!(EventType::from_code(event.code()).unwrap(), event);
        }
        assert!(EventType::from_code("X").is_err());
    }
}
