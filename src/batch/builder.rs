use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use change_log::Change;

use super::{is_batch_complete, BatchStatus, BatchStore, LoadStats, OutgoingBatch};
use crate::error::Result;
use crate::model::Channel;

/// One routed row inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub sequence_id: i64,
    pub router_id: String,
}

#[derive(Debug)]
struct OpenBatch {
    batch_id: i64,
    entries: Vec<BatchEntry>,
    byte_count: u64,
    create_time: DateTime<Utc>,
}

/// A complete batch waiting to be written with the pass's gap update.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub batch: OutgoingBatch,
    pub entries: Vec<BatchEntry>,
}

/// Accumulates routed rows of one channel pass into per-node batches.
///
/// Sealed batches stay in memory until [`BatchBuilder::write_sealed`], which
/// the pipeline runs inside the gap transaction. A failed pass therefore
/// leaves no batch behind for rows its gaps still hold.
pub struct BatchBuilder<'s, 'c> {
    store: &'s BatchStore<'c>,
    channel: Channel,
    open: BTreeMap<String, OpenBatch>,
    sealed: Vec<SealedBatch>,
}

impl<'s, 'c> BatchBuilder<'s, 'c> {
    pub fn new(store: &'s BatchStore<'c>, channel: Channel) -> Self {
        Self {
            store,
            channel,
            open: BTreeMap::new(),
            sealed: Vec::new(),
        }
    }

    /// Adds a row to the node's open batch, opening one if needed.
    pub fn assign(&mut self, change: &Change, node_id: &str, router_id: &str) -> Result<i64> {
        let batch = match self.open.entry(node_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(OpenBatch {
                batch_id: self.store.next_batch_id(node_id)?,
                entries: Vec::new(),
                byte_count: 0,
                create_time: self.store.now(),
            }),
        };
        batch.entries.push(BatchEntry {
            sequence_id: change.sequence_id,
            router_id: router_id.to_string(),
        });
        batch.byte_count += change.estimated_bytes();
        Ok(batch.batch_id)
    }

    /// Seals the batches of `node_ids` that the channel's algorithm considers complete.
    pub fn complete_after(&mut self, node_ids: &BTreeSet<String>, at_boundary: bool) {
        for node_id in node_ids {
            let complete = self.open.get(node_id).is_some_and(|batch| {
                is_batch_complete(
                    &self.channel,
                    batch.entries.len(),
                    batch.byte_count,
                    at_boundary,
                )
            });
            if complete {
                self.seal(node_id);
            }
        }
    }

    /// Closes the node's open batch with status NE.
    pub fn seal(&mut self, node_id: &str) -> Option<&OutgoingBatch> {
        let open = self.open.remove(node_id)?;
        let now = self.store.now();
        let batch = OutgoingBatch {
            node_id: node_id.to_string(),
            batch_id: open.batch_id,
            channel_id: self.channel.channel_id.clone(),
            status: BatchStatus::New,
            event_count: open.entries.len() as i64,
            byte_count: open.byte_count as i64,
            retry_count: 0,
            error_detail: None,
            load_stats: LoadStats::default(),
            create_time: open.create_time,
            last_update_time: now,
        };
        tracing::debug!(
            channel = %batch.channel_id,
            node = %node_id,
            batch_id = batch.batch_id,
            events = batch.event_count,
            "sealed batch"
        );
        self.sealed.push(SealedBatch {
            batch,
            entries: open.entries,
        });
        self.sealed.last().map(|s| &s.batch)
    }

    pub fn seal_all(&mut self) {
        let nodes: Vec<String> = self.open.keys().cloned().collect();
        for node_id in nodes {
            self.seal(&node_id);
        }
    }

    /// Writes every sealed batch. Safe to repeat after a rolled back attempt.
    pub fn write_sealed(&self) -> Result<()> {
        for sealed in &self.sealed {
            self.store.create(&sealed.batch, &sealed.entries)?;
        }
        Ok(())
    }

    /// Drops everything this pass built. The rows stay in the gaps and are routed again.
    pub fn discard(&mut self) {
        if !self.open.is_empty() || !self.sealed.is_empty() {
            tracing::debug!(
                channel = %self.channel.channel_id,
                open = self.open.len(),
                sealed = self.sealed.len(),
                "discarding batches of failed pass"
            );
        }
        self.open.clear();
        self.sealed.clear();
    }

    pub fn sealed(&self) -> &[SealedBatch] {
        &self.sealed
    }
}
