// ABOUTME: Change reader: producer thread that scans the change log inside a channel's gaps
// ABOUTME: Feeds a bounded read-ahead queue consumed by the routing loop

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use change_log::{Change, ChangeLogStore, DialectCapabilities, IdFilter, LogQuery};

use crate::error::{Result, RouteError};
use crate::gap::GapSnapshot;

#[derive(Debug)]
pub enum ReadItem {
    /// A row of the channel being routed.
    Change(Change),
    /// Id of a row inside the gaps that belongs to another channel.
    Foreign(i64),
}

impl ReadItem {
    pub fn sequence_id(&self) -> i64 {
        match self {
            ReadItem::Change(change) => change.sequence_id,
            ReadItem::Foreign(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub peek_ahead_window: usize,
    pub max_gaps_to_qualify: usize,
    pub max_data_to_route: usize,
    /// Stop exactly at `max_data_to_route` instead of finishing the transaction.
    pub nontransactional: bool,
    pub take_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderOutcome {
    pub rows_read: usize,
    pub foreign_rows: usize,
    /// Number of log queries issued; each fills the read-ahead queue once.
    pub fills: usize,
    /// The last query came back short, so nothing visible was left unread.
    pub all_data_read: bool,
    /// Too many gaps to qualify individually; scanned from the first gap.
    pub range_scan: bool,
}

/// Handle on a running reader thread.
pub struct ChangeReader {
    rx: Option<Receiver<ReadItem>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<ReaderOutcome>>>,
    take_timeout: Duration,
}

impl ChangeReader {
    pub fn start(
        log_path: &Path,
        capabilities: DialectCapabilities,
        channel_id: &str,
        snapshot: &GapSnapshot,
        settings: ReaderSettings,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let store = ChangeLogStore::open(log_path)?.with_capabilities(capabilities);
        let (tx, rx) = mpsc::sync_channel(settings.peek_ahead_window.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            store,
            channel_id: channel_id.to_string(),
            snapshot: snapshot.clone(),
            settings: settings.clone(),
            stop: Arc::clone(&stop),
            cancel,
            tx,
        };
        let thread = thread::Builder::new()
            .name(format!("reader-{channel_id}"))
            .spawn(move || producer.run())
            .map_err(|e| RouteError::Transient(format!("failed to spawn reader: {e}")))?;
        Ok(Self {
            rx: Some(rx),
            stop,
            thread: Some(thread),
            take_timeout: settings.take_timeout,
        })
    }

    /// Next row in id order, or `None` once the producer is done.
    pub fn take(&self) -> Result<Option<ReadItem>> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };
        match rx.recv_timeout(self.take_timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(RouteError::Transient(format!(
                "reader produced nothing for {:?}",
                self.take_timeout
            ))),
        }
    }

    /// Stops the producer and returns what it read.
    pub fn finish(mut self) -> Result<ReaderOutcome> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<ReaderOutcome> {
        self.stop.store(true, Ordering::SeqCst);
        // unblocks a producer waiting on a full queue
        drop(self.rx.take());
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RouteError::Transient("reader thread panicked".to_string()))?,
            None => Ok(ReaderOutcome::default()),
        }
    }
}

impl Drop for ChangeReader {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Producer {
    store: ChangeLogStore,
    channel_id: String,
    snapshot: GapSnapshot,
    settings: ReaderSettings,
    stop: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    tx: SyncSender<ReadItem>,
}

impl Producer {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.cancel.load(Ordering::SeqCst)
    }

    fn run(self) -> Result<ReaderOutcome> {
        let mut outcome = ReaderOutcome::default();
        let Some(first_start) = self.snapshot.first_start() else {
            return Ok(outcome);
        };

        let range_limit = self
            .settings
            .max_gaps_to_qualify
            .min(self.store.capabilities().max_id_ranges());
        let filter = if self.snapshot.gaps.len() > range_limit {
            outcome.range_scan = true;
            IdFilter::AtLeast(first_start)
        } else {
            IdFilter::Ranges(self.snapshot.ranges())
        };
        let nontransactional =
            self.settings.nontransactional || !self.store.capabilities().supports_transaction_id;
        let page_size = self.settings.peek_ahead_window.max(1);

        tracing::debug!(
            channel = %self.channel_id,
            gaps = self.snapshot.gaps.len(),
            range_scan = outcome.range_scan,
            "reader started"
        );

        let mut after_id = first_start - 1;
        let mut limit_tx: Option<Option<String>> = None;
        'pages: loop {
            if self.stopped() {
                break;
            }
            let page = self.store.fetch(&LogQuery {
                filter: filter.clone(),
                after_id,
                limit: page_size,
            })?;
            outcome.fills += 1;
            let short_page = page.len() < page_size;

            for change in page {
                if self.stopped() {
                    break 'pages;
                }
                after_id = change.sequence_id;
                if outcome.range_scan && !self.snapshot.contains(change.sequence_id) {
                    // routed by an earlier pass
                    continue;
                }

                if let Some(boundary) = &limit_tx {
                    let same_tx = !nontransactional
                        && change.channel_id == self.channel_id
                        && change.transaction_id.is_some()
                        && &change.transaction_id == boundary;
                    if !same_tx {
                        tracing::debug!(
                            channel = %self.channel_id,
                            rows = outcome.rows_read,
                            "max data to route reached"
                        );
                        return Ok(outcome);
                    }
                }

                let item = if change.channel_id == self.channel_id {
                    outcome.rows_read += 1;
                    if limit_tx.is_none() && outcome.rows_read >= self.settings.max_data_to_route {
                        limit_tx = Some(change.transaction_id.clone());
                    }
                    ReadItem::Change(change)
                } else {
                    outcome.foreign_rows += 1;
                    ReadItem::Foreign(change.sequence_id)
                };
                if self.tx.send(item).is_err() {
                    // consumer went away
                    return Ok(outcome);
                }
            }

            if short_page {
                outcome.all_data_read = true;
                break;
            }
        }
        Ok(outcome)
    }
}
