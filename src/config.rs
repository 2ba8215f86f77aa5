// ABOUTME: TOML configuration snapshot: engine parameters, nodes, channels, routers
// ABOUTME: Validated on load and fingerprinted so reloads can be detected cheaply

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{Channel, Node, RoutingRule};

/// Upper bound for second-valued durations added to timestamps (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Engine-wide tuning parameters (`[engine]` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Identity of the node this engine routes for.
    pub node_id: String,
    /// SQLite database holding the change log and router state.
    pub database: PathBuf,
    /// Capacity of the read-ahead queue and the page size of each log query.
    #[serde(default = "default_peek_ahead_window")]
    pub peek_ahead_window: usize,
    /// Above this many gaps the reader scans from the first gap instead of per-range.
    #[serde(default = "default_max_gaps_to_qualify")]
    pub max_gaps_to_qualify: usize,
    #[serde(default = "default_gap_grace_period_secs")]
    pub gap_grace_period_secs: u64,
    #[serde(default = "default_take_timeout_secs")]
    pub take_timeout_secs: u64,
    #[serde(default = "default_route_interval_ms")]
    pub route_interval_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_lock_expiry_secs")]
    pub lock_expiry_secs: u64,
    #[serde(default = "default_gap_update_retries")]
    pub gap_update_retries: u32,
}

impl EngineSettings {
    pub fn new(node_id: &str, database: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.to_string(),
            database: database.into(),
            peek_ahead_window: default_peek_ahead_window(),
            max_gaps_to_qualify: default_max_gaps_to_qualify(),
            gap_grace_period_secs: default_gap_grace_period_secs(),
            take_timeout_secs: default_take_timeout_secs(),
            route_interval_ms: default_route_interval_ms(),
            worker_threads: default_worker_threads(),
            lock_expiry_secs: default_lock_expiry_secs(),
            gap_update_retries: default_gap_update_retries(),
        }
    }

    pub fn grace_period(&self) -> chrono::Duration {
        bounded_seconds(self.gap_grace_period_secs)
    }

    pub fn take_timeout(&self) -> Duration {
        Duration::from_secs(self.take_timeout_secs)
    }

    pub fn route_interval(&self) -> Duration {
        Duration::from_millis(self.route_interval_ms)
    }

    pub fn lock_expiry(&self) -> chrono::Duration {
        bounded_seconds(self.lock_expiry_secs)
    }
}

fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub routers: Vec<RoutingRule>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.change-router/change-router.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        Ok(home.join(".change-router/change-router.toml"))
    }

    /// Structural checks. Rule expressions are compiled later, per rule.
    pub fn validate(&self) -> Result<()> {
        if self.engine.node_id.trim().is_empty() {
            bail!("engine.node_id cannot be empty");
        }
        if self.engine.peek_ahead_window == 0 {
            bail!("engine.peek_ahead_window must be greater than zero");
        }
        if self.engine.worker_threads == 0 {
            bail!("engine.worker_threads must be greater than zero");
        }
        if self.engine.route_interval_ms == 0 {
            bail!("engine.route_interval_ms must be greater than zero");
        }
        for (name, secs) in [
            ("gap_grace_period_secs", self.engine.gap_grace_period_secs),
            ("lock_expiry_secs", self.engine.lock_expiry_secs),
            ("take_timeout_secs", self.engine.take_timeout_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                bail!("engine.{name} must be at most {MAX_DURATION_SECS} seconds, got {secs}");
            }
        }
        if self.identity().is_none() {
            bail!(
                "engine.node_id '{}' does not match any [[nodes]] entry",
                self.engine.node_id
            );
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                bail!("duplicate node_id '{}'", node.node_id);
            }
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.channel_id.as_str()) {
                bail!("duplicate channel_id '{}'", channel.channel_id);
            }
            if channel.max_batch_size == 0 {
                bail!("channel '{}' max_batch_size must be greater than zero", channel.channel_id);
            }
            if channel.max_data_to_route == 0 {
                bail!(
                    "channel '{}' max_data_to_route must be greater than zero",
                    channel.channel_id
                );
            }
        }
        let mut seen = HashSet::new();
        for router in &self.routers {
            if !seen.insert(router.router_id.as_str()) {
                bail!("duplicate router_id '{}'", router.router_id);
            }
        }
        Ok(())
    }

    pub fn identity(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == self.engine.node_id)
    }

    pub fn channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    /// Channels in routing priority order.
    pub fn channels_by_priority(&self) -> Vec<&Channel> {
        let mut channels: Vec<&Channel> = self.channels.iter().collect();
        channels.sort_by(|a, b| {
            a.processing_order
                .cmp(&b.processing_order)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        channels
    }

    /// Returns a stable fingerprint for the routing configuration
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        // serializing our own types cannot fail
        let body = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(&body);
        format!("{:x}", hasher.finalize())
    }
}

fn default_peek_ahead_window() -> usize {
    1000
}

fn default_max_gaps_to_qualify() -> usize {
    100
}

fn default_gap_grace_period_secs() -> u64 {
    600
}

fn default_take_timeout_secs() -> u64 {
    330
}

fn default_route_interval_ms() -> u64 {
    10_000
}

fn default_worker_threads() -> usize {
    4
}

fn default_lock_expiry_secs() -> u64 {
    300
}

fn default_gap_update_retries() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
node_id = "corp-000"
database = "/tmp/router.db"
gap_grace_period_secs = 60

[[nodes]]
node_id = "corp-000"
node_group = "corp"

[[nodes]]
node_id = "store-001"
node_group = "store"
external_id = "001"

[[channels]]
channel_id = "sale"
processing_order = 1
max_batch_size = 50
batch_algorithm = "transactional"

[[channels]]
channel_id = "item"
processing_order = 2

[[routers]]
router_id = "corp_to_store"
source_node_group = "corp"
target_node_group = "store"
source_table = "orders"
router_type = "column_match"
expression = "STATUS=ACTIVE"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.engine.grace_period(), chrono::Duration::seconds(60));
        assert_eq!(config.engine.peek_ahead_window, 1000);
        assert_eq!(config.identity().unwrap().node_group, "corp");
        let sale = config.channel("sale").unwrap();
        assert_eq!(sale.batch_algorithm, crate::model::BatchAlgorithm::Transactional);
        assert_eq!(config.channel("item").unwrap().max_batch_size, 1000);
        assert!(config.routers[0].sync_on_update);
        let order: Vec<&str> = config
            .channels_by_priority()
            .iter()
            .map(|c| c.channel_id.as_str())
            .collect();
        assert_eq!(order, vec!["sale", "item"]);
    }

    #[test]
    fn test_unknown_identity_rejected() {
        let bad = SAMPLE.replace("node_id = \"corp-000\"\ndatabase", "node_id = \"nobody\"\ndatabase");
        let err = EngineConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("nobody"));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let bad = SAMPLE.replace("channel_id = \"item\"", "channel_id = \"sale\"");
        assert!(EngineConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.engine.gap_grace_period_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gap_grace_period_secs"));
        assert_eq!(
            config.engine.grace_period(),
            chrono::Duration::seconds(MAX_DURATION_SECS as i64)
        );

        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.engine.lock_expiry_secs = i64::MAX as u64;
        assert!(config.validate().is_err());

        let zero = SAMPLE.replace("gap_grace_period_secs = 60", "route_interval_ms = 0");
        assert!(EngineConfig::from_toml_str(&zero).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = EngineConfig::from_toml_str(SAMPLE).unwrap();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.routers[0].expression = Some("STATUS=PENDING".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
