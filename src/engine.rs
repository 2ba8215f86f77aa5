// ABOUTME: RoutingEngine: schedules channel passes and exposes the batch API to the transport
// ABOUTME: Passes run on tokio's blocking pool, bounded by a semaphore, in channel priority order

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use change_log::{Change, ChangeLogStore, DialectCapabilities};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;

use crate::batch::{BatchStatus, BatchStore, OutgoingBatch, TransitionDetail};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::db;
use crate::error::{ErrorCategory, Result, RouteError};
use crate::gap::{GapSnapshot, GapTracker};
use crate::lock::{ClusterLock, SqliteClusterLock};
use crate::pipeline::ChannelPipeline;
use crate::routing::{LookupSource, RouterSet, SqliteLookupSource};
use crate::stats::{ChannelStats, PassStats};

/// Routes every channel of a configuration snapshot.
///
/// The configuration can be swapped between passes with
/// [`RoutingEngine::update_configuration`]; passes already running keep the
/// snapshot they started with.
pub struct RoutingEngine {
    config: RwLock<Arc<EngineConfig>>,
    routers: RwLock<Arc<RouterSet>>,
    fingerprint: Mutex<String>,
    stats: Mutex<BTreeMap<String, ChannelStats>>,
    lookup: Arc<dyn LookupSource>,
    lock: Arc<dyn ClusterLock>,
    clock: Arc<dyn Clock>,
    capabilities: DialectCapabilities,
    cancel: Arc<AtomicBool>,
}

impl RoutingEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        validate(&config)?;
        // create the schema up front so API calls work before the first pass
        db::open(&config.engine.database)?;
        let lookup: Arc<dyn LookupSource> =
            Arc::new(SqliteLookupSource::new(&config.engine.database));
        let lock: Arc<dyn ClusterLock> = Arc::new(SqliteClusterLock::new(
            &config.engine.database,
            config.engine.lock_expiry(),
            Arc::clone(&clock),
        ));
        let routers = Arc::new(RouterSet::compile(&config.routers));
        let fingerprint = config.fingerprint();
        tracing::info!(
            node = %config.engine.node_id,
            channels = config.channels.len(),
            routers = routers.rules().len(),
            fingerprint = %fingerprint,
            "Routing engine configured"
        );
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            routers: RwLock::new(routers),
            fingerprint: Mutex::new(fingerprint),
            stats: Mutex::new(BTreeMap::new()),
            lookup,
            lock,
            clock,
            capabilities: DialectCapabilities::sqlite(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn LookupSource>) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn ClusterLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_capabilities(mut self, capabilities: DialectCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn router_set(&self) -> Arc<RouterSet> {
        Arc::clone(&self.routers.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn stats(&self) -> MutexGuard<'_, BTreeMap<String, ChannelStats>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Asks running passes to stop at the next row; they seal what they routed.
    ///
    /// Only passes already started see the request. The next
    /// [`RoutingEngine::route_all`] routes normally.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Runs one pass over every routable channel.
    ///
    /// Failures are recorded per channel and never abort the other channels.
    pub async fn route_all(&self) -> Result<Vec<PassStats>> {
        self.cancel.store(false, Ordering::SeqCst);
        let config = self.config();
        let routers = self.router_set();
        let identity = config
            .identity()
            .cloned()
            .ok_or_else(|| RouteError::config("engine", "identity node missing"))?;
        let nodes = Arc::new(config.nodes.clone());
        let semaphore = Arc::new(Semaphore::new(config.engine.worker_threads.max(1)));
        let mut tasks = JoinSet::new();

        let channels = config.channels_by_priority();
        for channel in &channels {
            if !channel.is_routable() {
                tracing::debug!(channel = %channel.channel_id, "channel disabled or suspended");
                continue;
            }
            if let Some(reason) = self.channel_flag(&channel.channel_id) {
                tracing::warn!(
                    channel = %channel.channel_id,
                    "Channel flagged for operator attention, not routing: {}",
                    reason
                );
                continue;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| RouteError::Transient(format!("worker pool closed: {e}")))?;
            let pipeline = ChannelPipeline {
                settings: config.engine.clone(),
                channel: (*channel).clone(),
                identity: identity.clone(),
                nodes: Arc::clone(&nodes),
                routers: Arc::clone(&routers),
                lookup: Arc::clone(&self.lookup),
                lock: Arc::clone(&self.lock),
                clock: Arc::clone(&self.clock),
                capabilities: self.capabilities.clone(),
                cancel: Arc::clone(&self.cancel),
            };
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.run_pass()))
                    .unwrap_or_else(|payload| {
                        Err(RouteError::Fatal(format!(
                            "routing pass panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                (pipeline.channel.channel_id, result)
            });
        }

        let mut passes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (channel_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Routing task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok(pass) => {
                    self.stats()
                        .entry(channel_id.clone())
                        .or_insert_with(|| ChannelStats::new(&channel_id))
                        .record_pass(&pass);
                    passes.push(pass);
                }
                Err(err) => self.record_failure(&channel_id, &err),
            }
        }

        let order: HashMap<&str, usize> = channels
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.channel_id.as_str(), idx))
            .collect();
        passes.sort_by_key(|p| order.get(p.channel_id.as_str()).copied().unwrap_or(usize::MAX));
        Ok(passes)
    }

    fn record_failure(&self, channel_id: &str, err: &RouteError) {
        let mut stats = self.stats();
        let entry = stats
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelStats::new(channel_id));
        entry.record_failure(&err.to_string());
        match err.category() {
            ErrorCategory::Transient | ErrorCategory::Conflict => {
                tracing::warn!(channel = %channel_id, error = %err, "Routing pass failed, will retry");
            }
            ErrorCategory::Fatal => {
                tracing::error!(
                    channel = %channel_id,
                    error = %err,
                    "Routing stopped for channel {}; clear the flag once the state is repaired",
                    channel_id
                );
                entry.flagged = Some(err.to_string());
            }
            _ => {
                tracing::error!(channel = %channel_id, error = %err, "Routing pass failed");
            }
        }
    }

    /// Routes on the configured interval until `shutdown` fires.
    ///
    /// A shutdown during a pass cancels it; the pass seals what it routed
    /// before this returns.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let period = self.config().engine.route_interval();
        let mut ticker = interval(period);
        let mut cycles = 0u64;
        tracing::info!("Starting routing engine with route_interval={:?}", period);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping routing engine");
                    self.cancel();
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    let pass = self.route_all();
                    tokio::pin!(pass);
                    let finished = tokio::select! {
                        biased;

                        result = &mut pass => Some(result),
                        _ = shutdown.recv() => None,
                    };
                    match finished {
                        Some(result) => log_cycle(cycles, result),
                        None => {
                            tracing::info!("Shutdown signal received during routing, cancelling");
                            self.cancel();
                            log_cycle(cycles, pass.await);
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Swaps in a new configuration. Returns false when nothing changed.
    pub fn update_configuration(&self, config: EngineConfig) -> Result<bool> {
        validate(&config)?;
        let fingerprint = config.fingerprint();
        let mut current = self.fingerprint.lock().unwrap_or_else(|e| e.into_inner());
        if *current == fingerprint {
            return Ok(false);
        }
        let routers = Arc::new(RouterSet::compile(&config.routers));
        tracing::info!(
            old = %current.as_str(),
            new = %fingerprint,
            routers = routers.rules().len(),
            rejected = routers.rejected().len(),
            "Routing configuration changed"
        );
        *self.routers.write().unwrap_or_else(|e| e.into_inner()) = routers;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
        *current = fingerprint;
        Ok(true)
    }

    pub fn channel_flag(&self, channel_id: &str) -> Option<String> {
        self.stats().get(channel_id).and_then(|s| s.flagged.clone())
    }

    /// Lets a channel stopped by a fatal error route again.
    pub fn clear_channel_flag(&self, channel_id: &str) -> bool {
        let mut stats = self.stats();
        match stats.get_mut(channel_id).and_then(|s| s.flagged.take()) {
            Some(reason) => {
                tracing::info!(channel = %channel_id, "Cleared channel flag: {}", reason);
                true
            }
            None => false,
        }
    }

    /// Per-channel statistics in channel priority order.
    pub fn statistics(&self) -> Vec<ChannelStats> {
        let config = self.config();
        let stats = self.stats();
        config
            .channels_by_priority()
            .into_iter()
            .map(|c| {
                stats
                    .get(&c.channel_id)
                    .cloned()
                    .unwrap_or_else(|| ChannelStats::new(&c.channel_id))
            })
            .collect()
    }

    /// Batches awaiting delivery to `node_id`, higher-priority channels first.
    pub fn list_sealed_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let config = self.config();
        let conn = db::open(&config.engine.database)?;
        let store = BatchStore::new(&conn, Arc::clone(&self.clock));
        let mut batches = store.list_sealed(node_id)?;
        batches.sort_by_key(|b| {
            let order = config
                .channel(&b.channel_id)
                .map(|c| c.processing_order)
                .unwrap_or(i32::MAX);
            (order, b.batch_id)
        });
        Ok(batches)
    }

    pub fn find_batches(
        &self,
        node_id: &str,
        status: Option<BatchStatus>,
    ) -> Result<Vec<OutgoingBatch>> {
        let conn = db::open(&self.config().engine.database)?;
        BatchStore::new(&conn, Arc::clone(&self.clock)).find(node_id, status)
    }

    pub fn report_batch_status(
        &self,
        node_id: &str,
        batch_id: i64,
        status: BatchStatus,
        detail: &TransitionDetail,
    ) -> Result<OutgoingBatch> {
        let conn = db::open(&self.config().engine.database)?;
        BatchStore::new(&conn, Arc::clone(&self.clock)).transition(node_id, batch_id, status, detail)
    }

    /// The batch's changes in routing order.
    pub fn batch_changes(&self, node_id: &str, batch_id: i64) -> Result<Vec<Change>> {
        let database = self.config().engine.database.clone();
        let conn = db::open(&database)?;
        let store = BatchStore::new(&conn, Arc::clone(&self.clock));
        if store.get(node_id, batch_id)?.is_none() {
            return Err(RouteError::BatchNotFound {
                node_id: node_id.to_string(),
                batch_id,
            });
        }
        let log = ChangeLogStore::open(&database)?.with_capabilities(self.capabilities.clone());
        let mut changes = Vec::new();
        for sequence_id in store.changes(node_id, batch_id)? {
            let change = log.get(sequence_id)?.ok_or_else(|| {
                RouteError::Fatal(format!(
                    "change {sequence_id} of batch {node_id}-{batch_id} is missing from the log"
                ))
            })?;
            changes.push(change);
        }
        Ok(changes)
    }

    /// Registers a batch received from `source_node_id`; false for a redelivery.
    pub fn record_incoming_batch(
        &self,
        source_node_id: &str,
        batch_id: i64,
        channel_id: &str,
    ) -> Result<bool> {
        let conn = db::open(&self.config().engine.database)?;
        BatchStore::new(&conn, Arc::clone(&self.clock)).record_incoming(
            source_node_id,
            batch_id,
            channel_id,
        )
    }

    pub fn report_incoming_status(
        &self,
        source_node_id: &str,
        batch_id: i64,
        status: BatchStatus,
        detail: &TransitionDetail,
    ) -> Result<()> {
        let conn = db::open(&self.config().engine.database)?;
        BatchStore::new(&conn, Arc::clone(&self.clock)).transition_incoming(
            source_node_id,
            batch_id,
            status,
            detail,
        )?;
        Ok(())
    }

    /// Current gaps of a channel, `None` before its first pass.
    pub fn gaps(&self, channel_id: &str) -> Result<Option<GapSnapshot>> {
        let config = self.config();
        let conn = db::open(&config.engine.database)?;
        GapTracker::new(
            &conn,
            channel_id,
            Arc::clone(&self.clock),
            config.engine.grace_period(),
            config.engine.gap_update_retries,
        )
        .peek()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn validate(config: &EngineConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| RouteError::config("configuration", format!("{e:#}")))
}

fn log_cycle(cycle: u64, result: Result<Vec<PassStats>>) {
    match result {
        Ok(passes) => {
            let rows: u64 = passes.iter().map(|p| p.counters.rows_read).sum();
            let batches: u64 = passes.iter().map(|p| p.counters.batches_sealed).sum();
            tracing::debug!(cycle, rows, batches, "routing cycle complete");
        }
        Err(e) => tracing::error!("Routing cycle {} failed: {}", cycle, e),
    }
}
