// ABOUTME: Routing and gap statistics per pass and per channel
// ABOUTME: Exposed through the engine API and printed by the CLI

use serde::Serialize;

use crate::routing::RouterCounters;

/// Outcome of one channel pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassStats {
    pub channel_id: String,
    /// Another instance held the channel's cluster lock.
    pub lock_skipped: bool,
    pub cancelled: bool,
    pub counters: RouterCounters,
    /// `(node_id, batch_id)` of every batch sealed by the pass.
    pub sealed: Vec<(String, i64)>,
    pub gaps_open: usize,
    pub gaps_resolved: usize,
    pub max_seen_id: i64,
    pub all_data_read: bool,
    pub range_scan: bool,
    pub duration_ms: u64,
}

/// Running totals for one channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub channel_id: String,
    pub passes: u64,
    pub failed_passes: u64,
    pub totals: RouterCounters,
    pub gaps_open: usize,
    pub gaps_resolved: u64,
    pub last_error: Option<String>,
    /// Set after a fatal error; the channel is not routed until cleared.
    pub flagged: Option<String>,
}

impl ChannelStats {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            ..Self::default()
        }
    }

    pub fn record_pass(&mut self, pass: &PassStats) {
        if pass.lock_skipped {
            return;
        }
        self.passes += 1;
        self.totals.add(&pass.counters);
        self.gaps_open = pass.gaps_open;
        self.gaps_resolved += pass.gaps_resolved as u64;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: &str) {
        self.passes += 1;
        self.failed_passes += 1;
        self.last_error = Some(error.to_string());
    }

    /// Check if the last pass completed and the channel is routable.
    pub fn is_success(&self) -> bool {
        self.last_error.is_none() && self.flagged.is_none()
    }
}
