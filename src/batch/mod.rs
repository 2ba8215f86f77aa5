// ABOUTME: Batch model: per-node, per-channel groups of routed changes and their status
// ABOUTME: Status transitions are validated here; persistence lives in store.rs

mod algorithm;
mod builder;
mod store;

pub use algorithm::is_batch_complete;
pub use builder::{BatchBuilder, BatchEntry, SealedBatch};
pub use store::BatchStore;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Sealed, waiting for the transport.
    New,
    Queued,
    Sending,
    Loading,
    Ok,
    Error,
    Ignored,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Queued => "QY",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Ignored => "IG",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ok | BatchStatus::Ignored)
    }

    fn progress(&self) -> Option<u8> {
        match self {
            BatchStatus::New => Some(0),
            BatchStatus::Queued => Some(1),
            BatchStatus::Sending => Some(2),
            BatchStatus::Loading => Some(3),
            BatchStatus::Ok => Some(4),
            BatchStatus::Error | BatchStatus::Ignored => None,
        }
    }

    /// Whether a batch may move from `self` to `to`. Staying put is always allowed.
    pub fn can_transition(&self, to: BatchStatus) -> bool {
        if *self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, BatchStatus::Ignored) => true,
            (BatchStatus::Error, to) => to != BatchStatus::Ok,
            (_, BatchStatus::Error) => true,
            (from, to) => match (from.progress(), to.progress()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for BatchStatus {
    type Err = RouteError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NE" => Ok(BatchStatus::New),
            "QY" => Ok(BatchStatus::Queued),
            "SE" => Ok(BatchStatus::Sending),
            "LD" => Ok(BatchStatus::Loading),
            "OK" => Ok(BatchStatus::Ok),
            "ER" => Ok(BatchStatus::Error),
            "IG" => Ok(BatchStatus::Ignored),
            other => Err(RouteError::config(
                "batch status",
                format!("unknown batch status '{other}'"),
            )),
        }
    }
}

/// Load-side statistics reported back by the applying node. Opaque to routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
}

/// Extra information carried by a status report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionDetail {
    pub error: Option<String>,
    /// Count this transition as a retry.
    pub increment_retry: bool,
    pub stats: Option<LoadStats>,
}

impl TransitionDetail {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn retry() -> Self {
        Self {
            increment_retry: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingBatch {
    pub node_id: String,
    pub batch_id: i64,
    pub channel_id: String,
    pub status: BatchStatus,
    pub event_count: i64,
    pub byte_count: i64,
    pub retry_count: i64,
    pub error_detail: Option<String>,
    pub load_stats: LoadStats,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingBatch {
    pub source_node_id: String,
    pub batch_id: i64,
    pub channel_id: String,
    pub status: BatchStatus,
    pub retry_count: i64,
    pub error_detail: Option<String>,
    pub load_stats: LoadStats,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}
