// ABOUTME: Configuration-level domain types: nodes, channels and routing rules
// ABOUTME: Loaded from TOML and shared read-only across channel passes

use serde::{Deserialize, Serialize};

pub use change_log::EventType;

/// A replication participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group: String,
    /// Business identifier used by lookup-table and script routing.
    #[serde(default)]
    pub external_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// How a channel decides that an open batch is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAlgorithm {
    /// Seal on size thresholds, but only between transactions.
    #[default]
    Default,
    /// Seal on size thresholds, even in the middle of a transaction.
    Nontransactional,
    /// Seal at every transaction boundary.
    Transactional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    /// Lower values are routed and listed first.
    #[serde(default)]
    pub processing_order: i32,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,
    /// Rows routed per pass before the reader stops at the next transaction boundary.
    #[serde(default = "default_max_data_to_route")]
    pub max_data_to_route: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub suspended: bool,
}

impl Channel {
    pub fn new(channel_id: &str, processing_order: i32, max_batch_size: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            processing_order,
            max_batch_size,
            max_batch_bytes: default_max_batch_bytes(),
            batch_algorithm: BatchAlgorithm::Default,
            max_data_to_route: default_max_data_to_route(),
            enabled: true,
            suspended: false,
        }
    }

    pub fn is_routable(&self) -> bool {
        self.enabled && !self.suspended
    }
}

/// Maps captured rows of one table from a source node group to a target node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub router_id: String,
    pub source_node_group: String,
    pub target_node_group: String,
    pub source_table: String,
    /// Strategy name: `default`, `column_match`, `lookup_table` or `script`.
    #[serde(default = "default_router_type")]
    pub router_type: String,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub sync_on_insert: bool,
    #[serde(default = "default_true")]
    pub sync_on_update: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
    /// Allow routing a change back to the node it came from.
    #[serde(default)]
    pub ping_back_enabled: bool,
}

impl RoutingRule {
    pub fn new(router_id: &str, source_group: &str, target_group: &str, table: &str) -> Self {
        Self {
            router_id: router_id.to_string(),
            source_node_group: source_group.to_string(),
            target_node_group: target_group.to_string(),
            source_table: table.to_string(),
            router_type: default_router_type(),
            expression: None,
            priority: 0,
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
            ping_back_enabled: false,
        }
    }

    pub fn with_strategy(mut self, router_type: &str, expression: &str) -> Self {
        self.router_type = router_type.to_string();
        self.expression = Some(expression.to_string());
        self
    }

    pub fn syncs(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::Insert => self.sync_on_insert,
            EventType::Update => self.sync_on_update,
            EventType::Delete => self.sync_on_delete,
            EventType::Reload | EventType::Sql => true,
        }
    }

    pub fn applies_to_table(&self, table_name: &str) -> bool {
        self.source_table.eq_ignore_ascii_case(table_name)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_data_to_route() -> usize {
    100_000
}

fn default_router_type() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_event_flags() {
        let mut rule = RoutingRule::new("r1", "corp", "store", "orders");
        rule.sync_on_delete = false;
        assert!(rule.syncs(EventType::Insert));
        assert!(!rule.syncs(EventType::Delete));
        assert!(rule.syncs(EventType::Reload));
        assert!(rule.applies_to_table("ORDERS"));
    }

    #[test]
    fn test_channel_routable() {
        let mut channel = Channel::new("sale", 1, 100);
        assert!(channel.is_routable());
        channel.suspended = true;
        assert!(!channel.is_routable());
    }
}
