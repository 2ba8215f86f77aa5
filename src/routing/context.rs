use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::model::{Channel, Node, RoutingRule};

use super::lookup_table::{LookupSnapshot, LookupSource, LookupTableSettings};

/// Counters for one routing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterCounters {
    pub rows_read: u64,
    pub rows_routed: u64,
    /// Rows no rule sent anywhere.
    pub rows_unrouted: u64,
    /// (change, node) pairs added to batches.
    pub data_events: u64,
    pub evaluation_errors: u64,
    pub foreign_rows: u64,
    pub peek_ahead_fills: u64,
    pub batches_sealed: u64,
}

impl RouterCounters {
    pub fn add(&mut self, other: &RouterCounters) {
        self.rows_read += other.rows_read;
        self.rows_routed += other.rows_routed;
        self.rows_unrouted += other.rows_unrouted;
        self.data_events += other.data_events;
        self.evaluation_errors += other.evaluation_errors;
        self.foreign_rows += other.foreign_rows;
        self.peek_ahead_fills += other.peek_ahead_fills;
        self.batches_sealed += other.batches_sealed;
    }
}

/// Per-pass state shared by all rule evaluations. Never persisted.
pub struct RouterContext {
    pub channel: Channel,
    pub identity: Node,
    nodes: Arc<Vec<Node>>,
    lookup: Arc<dyn LookupSource>,
    lookup_cache: HashMap<LookupTableSettings, Arc<LookupSnapshot>>,
    candidate_cache: HashMap<String, Arc<Vec<Node>>>,
    pub counters: RouterCounters,
}

impl RouterContext {
    pub fn new(
        channel: Channel,
        identity: Node,
        nodes: Arc<Vec<Node>>,
        lookup: Arc<dyn LookupSource>,
    ) -> Self {
        Self {
            channel,
            identity,
            nodes,
            lookup,
            lookup_cache: HashMap::new(),
            candidate_cache: HashMap::new(),
            counters: RouterCounters::default(),
        }
    }

    /// Enabled nodes of the rule's target group, never including ourselves.
    pub fn candidates(&mut self, rule: &RoutingRule) -> Arc<Vec<Node>> {
        if let Some(cached) = self.candidate_cache.get(&rule.target_node_group) {
            return Arc::clone(cached);
        }
        let nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| {
                n.enabled
                    && n.node_group == rule.target_node_group
                    && n.node_id != self.identity.node_id
            })
            .cloned()
            .collect();
        let nodes = Arc::new(nodes);
        self.candidate_cache
            .insert(rule.target_node_group.clone(), Arc::clone(&nodes));
        nodes
    }

    /// Lookup table contents, read at most once per pass.
    pub fn lookup_snapshot(&mut self, table: &LookupTableSettings) -> Result<Arc<LookupSnapshot>> {
        if let Some(cached) = self.lookup_cache.get(table) {
            return Ok(Arc::clone(cached));
        }
        let snapshot = Arc::new(self.lookup.load(table)?);
        self.lookup_cache.insert(table.clone(), Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
