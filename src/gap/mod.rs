// ABOUTME: Gap model: sequence-id intervals whose commit status is not yet known
// ABOUTME: Holds the shared types plus the structural validation of a gap list

mod compute;
mod tracker;

pub use compute::{compute_gaps, GapUpdate};
pub use tracker::GapTracker;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Result, RouteError};

/// End id of the head gap, which is unbounded.
pub const OPEN_END: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    Open,
    /// Being scanned by a pass. Loaded back as open after a crash.
    InProgress,
    Resolved,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Open => "OPEN",
            GapStatus::InProgress => "IN_PROGRESS",
            GapStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "OPEN" => Ok(GapStatus::Open),
            "IN_PROGRESS" => Ok(GapStatus::InProgress),
            "RESOLVED" => Ok(GapStatus::Resolved),
            other => Err(RouteError::Fatal(format!("unknown gap status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub start_id: i64,
    /// Inclusive; `OPEN_END` for the head gap.
    pub end_id: i64,
    pub status: GapStatus,
    pub create_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Gap {
    pub fn new(start_id: i64, end_id: i64, create_time: DateTime<Utc>) -> Self {
        Self {
            start_id,
            end_id,
            status: GapStatus::Open,
            create_time,
            last_updated: create_time,
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.start_id && id <= self.end_id
    }

    pub fn is_head(&self) -> bool {
        self.end_id == OPEN_END
    }

    pub fn same_range(&self, other: &Gap) -> bool {
        self.start_id == other.start_id && self.end_id == other.end_id
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "[{}, open)", self.start_id)
        } else {
            write!(f, "[{}, {}]", self.start_id, self.end_id)
        }
    }
}

/// Gap list of one channel at a checkpoint version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapSnapshot {
    pub channel_id: String,
    pub version: i64,
    pub max_seen_id: i64,
    pub gaps: Vec<Gap>,
}

impl GapSnapshot {
    /// Inclusive id ranges to scan, in order.
    pub fn ranges(&self) -> Vec<(i64, i64)> {
        self.gaps.iter().map(|g| (g.start_id, g.end_id)).collect()
    }

    pub fn contains(&self, id: i64) -> bool {
        // gaps are sorted, so binary search on start
        let idx = self.gaps.partition_point(|g| g.start_id <= id);
        idx > 0 && self.gaps[idx - 1].contains(id)
    }

    pub fn first_start(&self) -> Option<i64> {
        self.gaps.first().map(|g| g.start_id)
    }
}

/// Rejects gap lists that cannot come from a correct history.
pub fn validate(channel_id: &str, gaps: &[Gap]) -> Result<()> {
    let Some(last) = gaps.last() else {
        return Err(RouteError::Fatal(format!(
            "channel {channel_id} has no head gap"
        )));
    };
    if !last.is_head() {
        return Err(RouteError::Fatal(format!(
            "channel {channel_id} last gap {last} is not open-ended"
        )));
    }
    for gap in gaps {
        if gap.start_id > gap.end_id {
            return Err(RouteError::Fatal(format!(
                "channel {channel_id} gap {gap} starts after it ends"
            )));
        }
    }
    for pair in gaps.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.is_head() {
            return Err(RouteError::Fatal(format!(
                "channel {channel_id} open-ended gap {prev} is not last"
            )));
        }
        if prev.end_id >= next.start_id {
            return Err(RouteError::Fatal(format!(
                "channel {channel_id} gaps {prev} and {next} overlap or are out of order"
            )));
        }
    }
    Ok(())
}
