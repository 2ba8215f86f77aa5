#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use change_log::{ChangeLogStore, DialectCapabilities, NewChange, TableDef};
use change_router::batch::{BatchStore, OutgoingBatch};
use change_router::clock::{Clock, ManualClock};
use change_router::config::EngineSettings;
use change_router::db;
use change_router::gap::{Gap, GapTracker};
use change_router::lock::SqliteClusterLock;
use change_router::model::{Channel, Node, RoutingRule};
use change_router::pipeline::ChannelPipeline;
use change_router::routing::{RouterSet, SqliteLookupSource};
use chrono::{Duration, Utc};
use tempfile::TempDir;

pub fn node(id: &str, group: &str, external: &str) -> Node {
    Node {
        node_id: id.to_string(),
        node_group: group.to_string(),
        external_id: external.to_string(),
        enabled: true,
    }
}

/// corp-000 routes to three stores.
pub fn nodes() -> Vec<Node> {
    vec![
        node("corp-000", "corp", "000"),
        node("store-001", "store", "001"),
        node("store-002", "store", "002"),
        node("store-003", "store", "003"),
    ]
}

/// A router database with an `orders(id, status)` table captured into it.
pub struct Harness {
    _dir: TempDir,
    pub path: PathBuf,
    pub clock: Arc<ManualClock>,
    pub log: ChangeLogStore,
    pub hist: i64,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.db");
        let log = ChangeLogStore::open(&path).unwrap();
        let hist = log
            .register_table(&TableDef::new("orders", &["id", "status"], &["id"]))
            .unwrap();
        Self {
            _dir: dir,
            path,
            clock: Arc::new(ManualClock::new(Utc::now())),
            log,
            hist,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn row(&self, channel: &str, status: &str, tx: &str) -> NewChange {
        NewChange::insert(self.hist, channel, &[Some("1"), Some(status)]).with_transaction(tx)
    }

    /// Appends a change with the next sequence id.
    pub fn append(&self, channel: &str, status: &str, tx: &str) -> i64 {
        self.log.append(&self.row(channel, status, tx)).unwrap()
    }

    /// Commits a change under an id issued earlier.
    pub fn commit(&self, id: i64, channel: &str, status: &str) -> i64 {
        self.log
            .append_with_id(id, &self.row(channel, status, &format!("tx-{id}")))
            .unwrap()
    }

    pub fn settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::new("corp-000", &self.path);
        settings.peek_ahead_window = 4;
        settings.gap_grace_period_secs = 600;
        settings
    }

    pub fn pipeline(&self, channel: Channel, rules: &[RoutingRule]) -> ChannelPipeline {
        let nodes = nodes();
        ChannelPipeline {
            settings: self.settings(),
            channel,
            identity: nodes[0].clone(),
            nodes: Arc::new(nodes),
            routers: Arc::new(RouterSet::compile(rules)),
            lookup: Arc::new(SqliteLookupSource::new(&self.path)),
            lock: Arc::new(SqliteClusterLock::new(
                &self.path,
                Duration::minutes(5),
                self.clock(),
            )),
            clock: self.clock(),
            capabilities: DialectCapabilities::sqlite(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every batch of a node in batch id order, with its sequence ids.
    pub fn batches(&self, node_id: &str) -> Vec<(OutgoingBatch, Vec<i64>)> {
        let conn = db::open(&self.path).unwrap();
        let store = BatchStore::new(&conn, self.clock());
        store
            .find(node_id, None)
            .unwrap()
            .into_iter()
            .map(|batch| {
                let ids = store.changes(node_id, batch.batch_id).unwrap();
                (batch, ids)
            })
            .collect()
    }

    pub fn gaps(&self, channel: &str) -> Vec<Gap> {
        let conn = db::open(&self.path).unwrap();
        GapTracker::new(&conn, channel, self.clock(), Duration::minutes(10), 3)
            .load()
            .unwrap()
            .gaps
    }

    pub fn gap_ranges(&self, channel: &str) -> Vec<(i64, i64)> {
        self.gaps(channel)
            .iter()
            .map(|g| (g.start_id, g.end_id))
            .collect()
    }
}

pub fn all_stores() -> RoutingRule {
    RoutingRule::new("corp_to_store", "corp", "store", "orders")
}
