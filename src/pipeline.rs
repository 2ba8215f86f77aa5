// ABOUTME: One routing pass over one channel: gaps -> reader -> router -> batches
// ABOUTME: Processed ids are folded into the gaps only after batches are sealed

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use change_log::{Change, ChangeLogStore, DialectCapabilities};

use crate::batch::{BatchBuilder, BatchStore};
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::db;
use crate::error::Result;
use crate::gap::{GapSnapshot, GapTracker};
use crate::lock::{ClusterLock, LockGuard};
use crate::model::{BatchAlgorithm, Channel, Node};
use crate::reader::{ChangeReader, ReadItem, ReaderOutcome, ReaderSettings};
use crate::routing::{LookupSource, RouterContext, RouterSet};
use crate::stats::PassStats;

/// Everything a channel pass needs, owned so it can run on a blocking thread.
#[derive(Clone)]
pub struct ChannelPipeline {
    pub settings: EngineSettings,
    pub channel: Channel,
    pub identity: Node,
    pub nodes: Arc<Vec<Node>>,
    pub routers: Arc<RouterSet>,
    pub lookup: Arc<dyn LookupSource>,
    pub lock: Arc<dyn ClusterLock>,
    pub clock: Arc<dyn Clock>,
    pub capabilities: DialectCapabilities,
    pub cancel: Arc<AtomicBool>,
}

struct Consumed {
    outcome: ReaderOutcome,
    cancelled: bool,
}

impl ChannelPipeline {
    pub fn lock_name(&self) -> String {
        format!("ROUTE_{}", self.channel.channel_id)
    }

    /// Routes whatever the channel's gaps currently expose.
    ///
    /// On failure unsealed batches are dropped and the gaps are left as they
    /// were, so the same rows are read again by the next pass.
    pub fn run_pass(&self) -> Result<PassStats> {
        let started = Instant::now();
        let channel_id = self.channel.channel_id.as_str();
        let mut stats = PassStats {
            channel_id: channel_id.to_string(),
            ..PassStats::default()
        };

        let Some(_guard) = LockGuard::acquire(&self.lock, &self.lock_name())? else {
            tracing::info!(channel = %channel_id, "Channel is being routed elsewhere, skipping");
            stats.lock_skipped = true;
            return Ok(stats);
        };

        let conn = db::open(&self.settings.database)?;
        let tracker = GapTracker::new(
            &conn,
            channel_id,
            Arc::clone(&self.clock),
            self.settings.grace_period(),
            self.settings.gap_update_retries,
        );
        let snapshot = tracker.load()?;
        let scanning = tracker.begin_pass(&snapshot)?;

        let store = BatchStore::new(&conn, Arc::clone(&self.clock));
        let mut builder = BatchBuilder::new(&store, self.channel.clone());
        let mut ctx = RouterContext::new(
            self.channel.clone(),
            self.identity.clone(),
            Arc::clone(&self.nodes),
            Arc::clone(&self.lookup),
        );
        let mut processed = BTreeSet::new();

        let consumed = self.consume(&scanning, &mut builder, &mut ctx, &mut processed);
        builder.seal_all();
        let consumed = match consumed {
            Ok(consumed) => consumed,
            Err(err) => {
                builder.discard();
                tracker.abort_pass();
                return Err(err);
            }
        };

        let log = match ChangeLogStore::open(&self.settings.database) {
            Ok(log) => log,
            Err(err) => {
                tracker.abort_pass();
                return Err(err.into());
            }
        };
        let mut recheck = |start: i64, end: i64| -> Result<i64> {
            Ok(log.count_in_range(start, end)?)
        };
        // tracker and store share `conn`: batches commit with the gap update
        let mut write_batches = || builder.write_sealed();
        let update =
            match tracker.record_pass(&scanning, &processed, &mut recheck, &mut write_batches) {
                Ok(update) => update,
                Err(err) => {
                    builder.discard();
                    tracker.abort_pass();
                    return Err(err);
                }
            };

        ctx.counters.peek_ahead_fills = consumed.outcome.fills as u64;
        ctx.counters.batches_sealed = builder.sealed().len() as u64;
        stats.counters = ctx.counters;
        stats.sealed = builder
            .sealed()
            .iter()
            .map(|s| (s.batch.node_id.clone(), s.batch.batch_id))
            .collect();
        stats.cancelled = consumed.cancelled;
        stats.all_data_read = consumed.outcome.all_data_read;
        stats.range_scan = consumed.outcome.range_scan;
        stats.gaps_open = update.gaps.len();
        stats.gaps_resolved = update.resolved.len();
        stats.max_seen_id = update.max_seen_id;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        if stats.counters.rows_read > 0 {
            tracing::info!(
                channel = %channel_id,
                rows = stats.counters.rows_read,
                routed = stats.counters.rows_routed,
                batches = stats.counters.batches_sealed,
                gaps = stats.gaps_open,
                "Routed {} rows in {}ms",
                stats.counters.rows_read,
                stats.duration_ms
            );
        } else {
            tracing::debug!(channel = %channel_id, gaps = stats.gaps_open, "nothing to route");
        }
        Ok(stats)
    }

    fn consume(
        &self,
        scanning: &GapSnapshot,
        builder: &mut BatchBuilder<'_, '_>,
        ctx: &mut RouterContext,
        processed: &mut BTreeSet<i64>,
    ) -> Result<Consumed> {
        let reader = ChangeReader::start(
            &self.settings.database,
            self.capabilities.clone(),
            &self.channel.channel_id,
            scanning,
            ReaderSettings {
                peek_ahead_window: self.settings.peek_ahead_window,
                max_gaps_to_qualify: self.settings.max_gaps_to_qualify,
                max_data_to_route: self.channel.max_data_to_route,
                nontransactional: self.channel.batch_algorithm == BatchAlgorithm::Nontransactional,
                take_timeout: self.settings.take_timeout(),
            },
            Arc::clone(&self.cancel),
        )?;

        // a row is routed once the next one tells whether it ends its transaction
        let mut pending: Option<Change> = None;
        let mut cancelled = false;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            match reader.take()? {
                None => break,
                Some(ReadItem::Foreign(id)) => {
                    ctx.counters.foreign_rows += 1;
                    processed.insert(id);
                }
                Some(ReadItem::Change(change)) => {
                    if let Some(previous) = pending.take() {
                        let at_boundary = previous.transaction_id.is_none()
                            || previous.transaction_id != change.transaction_id;
                        self.route_one(&previous, at_boundary, builder, ctx)?;
                        processed.insert(previous.sequence_id);
                    }
                    pending = Some(change);
                }
            }
        }
        if let Some(last) = pending.take() {
            self.route_one(&last, false, builder, ctx)?;
            processed.insert(last.sequence_id);
        }
        if cancelled {
            tracing::info!(
                channel = %self.channel.channel_id,
                rows = ctx.counters.rows_read,
                "Routing cancelled, sealing open batches"
            );
        }

        let outcome = reader.finish()?;
        Ok(Consumed { outcome, cancelled })
    }

    fn route_one(
        &self,
        change: &Change,
        at_boundary: bool,
        builder: &mut BatchBuilder<'_, '_>,
        ctx: &mut RouterContext,
    ) -> Result<()> {
        ctx.counters.rows_read += 1;
        let targets = self.routers.route_targets(change, ctx)?;
        if targets.is_empty() {
            ctx.counters.rows_unrouted += 1;
            return Ok(());
        }
        ctx.counters.rows_routed += 1;
        for (node_id, router_id) in &targets {
            builder.assign(change, node_id, router_id)?;
            ctx.counters.data_events += 1;
        }
        let nodes: BTreeSet<String> = targets.into_keys().collect();
        builder.complete_after(&nodes, at_boundary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchStatus;
    use crate::clock::SystemClock;
    use crate::lock::SqliteClusterLock;
    use crate::model::RoutingRule;
    use crate::routing::test_support::{identity, nodes};
    use crate::routing::SqliteLookupSource;
    use change_log::{NewChange, TableDef};

    fn pipeline(path: &std::path::Path, channel: Channel, rules: &[RoutingRule]) -> ChannelPipeline {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut all = nodes();
        all.push(identity());
        ChannelPipeline {
            settings: EngineSettings::new("corp-000", path),
            channel,
            identity: identity(),
            nodes: Arc::new(all),
            routers: Arc::new(RouterSet::compile(rules)),
            lookup: Arc::new(SqliteLookupSource::new(path)),
            lock: Arc::new(SqliteClusterLock::new(
                path,
                chrono::Duration::minutes(5),
                Arc::clone(&clock),
            )),
            clock,
            capabilities: DialectCapabilities::sqlite(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn seed(path: &std::path::Path, rows: &[(&str, &str)]) {
        let log = ChangeLogStore::open(path).unwrap();
        let hist = log
            .register_table(&TableDef::new("orders", &["id", "status"], &["id"]))
            .unwrap();
        for (idx, (status, tx)) in rows.iter().enumerate() {
            let id = (idx + 1).to_string();
            let change = NewChange::insert(hist, "sale", &[Some(id.as_str()), Some(status)])
                .with_transaction(tx);
            log.append(&change).unwrap();
        }
    }

    #[test]
    fn test_pass_routes_and_advances_head_gap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.db");
        seed(&path, &[("ACTIVE", "t1"), ("CLOSED", "t1"), ("ACTIVE", "t2")]);
        let rules = [RoutingRule::new("active", "corp", "store", "orders")
            .with_strategy("column_match", "STATUS=ACTIVE")];
        let p = pipeline(&path, Channel::new("sale", 1, 100), &rules);

        let stats = p.run_pass().unwrap();
        assert_eq!(stats.counters.rows_read, 3);
        assert_eq!(stats.counters.rows_routed, 2);
        assert_eq!(stats.counters.rows_unrouted, 1);
        assert_eq!(stats.counters.data_events, 6);
        assert_eq!(stats.sealed.len(), 3);
        assert_eq!(stats.gaps_open, 1);
        assert!(stats.all_data_read);

        let conn = db::open(&path).unwrap();
        let store = BatchStore::new(&conn, Arc::new(SystemClock));
        let batches = store.find("store-002", Some(BatchStatus::New)).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(store.changes("store-002", batches[0].batch_id).unwrap(), vec![1, 3]);

        // nothing new: the next pass reads nothing
        let again = p.run_pass().unwrap();
        assert_eq!(again.counters.rows_read, 0);
        assert!(again.sealed.is_empty());
    }

    #[test]
    fn test_cancelled_pass_routes_nothing_and_keeps_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.db");
        seed(&path, &[("ACTIVE", "t1")]);
        let p = pipeline(
            &path,
            Channel::new("sale", 1, 100),
            &[RoutingRule::new("all", "corp", "store", "orders")],
        );
        p.cancel.store(true, Ordering::SeqCst);
        let stats = p.run_pass().unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.counters.rows_read, 0);

        p.cancel.store(false, Ordering::SeqCst);
        let stats = p.run_pass().unwrap();
        assert_eq!(stats.counters.rows_read, 1);
    }

    #[test]
    fn test_transactional_channel_seals_per_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.db");
        seed(&path, &[("A", "t1"), ("A", "t1"), ("A", "t2"), ("A", "t3")]);
        let mut channel = Channel::new("sale", 1, 100);
        channel.batch_algorithm = BatchAlgorithm::Transactional;
        let p = pipeline(&path, channel, &[RoutingRule::new("all", "corp", "store", "orders")]);

        p.run_pass().unwrap();
        let conn = db::open(&path).unwrap();
        let store = BatchStore::new(&conn, Arc::new(SystemClock));
        let sizes: Vec<i64> = store
            .find("store-001", None)
            .unwrap()
            .iter()
            .map(|b| b.event_count)
            .collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }
}
