use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{BatchEntry, BatchStatus, IncomingBatch, LoadStats, OutgoingBatch, TransitionDetail};
use crate::clock::Clock;
use crate::error::{Result, RouteError};

const OUTGOING_COLUMNS: &str = "node_id, batch_id, channel_id, status, event_count, byte_count, \
     retry_count, error_detail, fallback_insert_count, fallback_update_count, \
     missing_delete_count, create_time, last_update_time";

const INCOMING_COLUMNS: &str = "source_node_id, batch_id, channel_id, status, retry_count, \
     error_detail, fallback_insert_count, fallback_update_count, missing_delete_count, \
     create_time, last_update_time";

/// Persisted lifecycle of outgoing and incoming batches.
pub struct BatchStore<'c> {
    conn: &'c Connection,
    clock: Arc<dyn Clock>,
}

impl<'c> BatchStore<'c> {
    pub fn new(conn: &'c Connection, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Draws the next batch id for a node. Ids are never reused.
    pub fn next_batch_id(&self, node_id: &str) -> Result<i64> {
        let id = self.conn.query_row(
            "INSERT INTO batch_sequence(node_id, last_batch_id) VALUES (?1, 1)
             ON CONFLICT(node_id) DO UPDATE SET last_batch_id = last_batch_id + 1
             RETURNING last_batch_id",
            [node_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Persists a sealed batch and its ordered rows atomically.
    ///
    /// Uses a savepoint, so inside an open transaction the batch commits or
    /// rolls back with it.
    pub fn create(&self, batch: &OutgoingBatch, entries: &[BatchEntry]) -> Result<()> {
        self.conn.execute_batch("SAVEPOINT create_batch")?;
        match self.insert(batch, entries) {
            Ok(()) => {
                self.conn.execute_batch("RELEASE create_batch")?;
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .conn
                    .execute_batch("ROLLBACK TO create_batch; RELEASE create_batch");
                Err(err)
            }
        }
    }

    fn insert(&self, batch: &OutgoingBatch, entries: &[BatchEntry]) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO outgoing_batch({OUTGOING_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                batch.node_id,
                batch.batch_id,
                batch.channel_id,
                batch.status.code(),
                batch.event_count,
                batch.byte_count,
                batch.retry_count,
                batch.error_detail,
                batch.load_stats.fallback_insert_count,
                batch.load_stats.fallback_update_count,
                batch.load_stats.missing_delete_count,
                batch.create_time,
                batch.last_update_time,
            ],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO outgoing_batch_data(node_id, batch_id, position, data_id, router_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (position, entry) in entries.iter().enumerate() {
            stmt.execute(params![
                batch.node_id,
                batch.batch_id,
                position as i64,
                entry.sequence_id,
                entry.router_id,
            ])?;
        }
        Ok(())
    }

    pub fn get(&self, node_id: &str, batch_id: i64) -> Result<Option<OutgoingBatch>> {
        let batch = self
            .conn
            .query_row(
                &format!(
                    "SELECT {OUTGOING_COLUMNS} FROM outgoing_batch WHERE node_id = ?1 AND batch_id = ?2"
                ),
                params![node_id, batch_id],
                outgoing_from_row,
            )
            .optional()?;
        batch.transpose()
    }

    /// Batches of a node in batch id order, optionally of one status.
    pub fn find(&self, node_id: &str, status: Option<BatchStatus>) -> Result<Vec<OutgoingBatch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTGOING_COLUMNS} FROM outgoing_batch
             WHERE node_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY batch_id"
        ))?;
        let rows = stmt.query_map(params![node_id, status.map(|s| s.code())], outgoing_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Batches of a node still waiting for delivery or a retry.
    pub fn list_sealed(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTGOING_COLUMNS} FROM outgoing_batch
             WHERE node_id = ?1 AND status NOT IN (?2, ?3)
             ORDER BY batch_id"
        ))?;
        let rows = stmt.query_map(
            params![node_id, BatchStatus::Ok.code(), BatchStatus::Ignored.code()],
            outgoing_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Sequence ids of a batch in the order they were routed.
    pub fn changes(&self, node_id: &str, batch_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT data_id FROM outgoing_batch_data
             WHERE node_id = ?1 AND batch_id = ?2 ORDER BY position",
        )?;
        let ids = stmt
            .query_map(params![node_id, batch_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Moves a batch to `to`. Repeating the current status is a no-op.
    pub fn transition(
        &self,
        node_id: &str,
        batch_id: i64,
        to: BatchStatus,
        detail: &TransitionDetail,
    ) -> Result<OutgoingBatch> {
        let current = self
            .get(node_id, batch_id)?
            .ok_or_else(|| RouteError::BatchNotFound {
                node_id: node_id.to_string(),
                batch_id,
            })?;
        if current.status == to {
            return Ok(current);
        }
        if !current.status.can_transition(to) {
            return Err(RouteError::InvalidTransition {
                node_id: node_id.to_string(),
                batch_id,
                from: current.status,
                to,
            });
        }
        let now = self.clock.now();
        let stats = detail.stats.unwrap_or(current.load_stats);
        let updated = self.conn.execute(
            "UPDATE outgoing_batch SET status = ?3, error_detail = COALESCE(?4, error_detail),
                 retry_count = retry_count + ?5, fallback_insert_count = ?6,
                 fallback_update_count = ?7, missing_delete_count = ?8, last_update_time = ?9
             WHERE node_id = ?1 AND batch_id = ?2 AND status = ?10",
            params![
                node_id,
                batch_id,
                to.code(),
                detail.error,
                i64::from(detail.increment_retry),
                stats.fallback_insert_count,
                stats.fallback_update_count,
                stats.missing_delete_count,
                now,
                current.status.code(),
            ],
        )?;
        if updated == 0 {
            return Err(RouteError::Conflict(format!("batch {node_id}-{batch_id}")));
        }
        if to == BatchStatus::Error {
            tracing::warn!(
                node = %node_id,
                batch_id,
                error = detail.error.as_deref().unwrap_or(""),
                "Batch {}-{} failed to load",
                node_id,
                batch_id
            );
        } else {
            tracing::debug!(node = %node_id, batch_id, status = %to, "batch status updated");
        }
        self.get(node_id, batch_id)?
            .ok_or_else(|| RouteError::BatchNotFound {
                node_id: node_id.to_string(),
                batch_id,
            })
    }

    /// Registers a batch arriving from another node.
    ///
    /// Returns false when the batch was already loaded, so the caller can
    /// acknowledge a redelivery without applying it again.
    pub fn record_incoming(
        &self,
        source_node_id: &str,
        batch_id: i64,
        channel_id: &str,
    ) -> Result<bool> {
        let now = self.clock.now();
        match self.get_incoming(source_node_id, batch_id)? {
            Some(existing) if existing.status.is_terminal() => {
                tracing::info!(
                    node = %source_node_id,
                    batch_id,
                    "Skipping duplicate batch {}-{}",
                    source_node_id,
                    batch_id
                );
                Ok(false)
            }
            Some(_) => {
                self.conn.execute(
                    "UPDATE incoming_batch SET status = ?3, retry_count = retry_count + 1,
                         error_detail = NULL, last_update_time = ?4
                     WHERE source_node_id = ?1 AND batch_id = ?2",
                    params![source_node_id, batch_id, BatchStatus::Loading.code(), now],
                )?;
                Ok(true)
            }
            None => {
                self.conn.execute(
                    &format!(
                        "INSERT INTO incoming_batch({INCOMING_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, 0, NULL, 0, 0, 0, ?5, ?5)"
                    ),
                    params![
                        source_node_id,
                        batch_id,
                        channel_id,
                        BatchStatus::Loading.code(),
                        now
                    ],
                )?;
                Ok(true)
            }
        }
    }

    pub fn get_incoming(&self, source_node_id: &str, batch_id: i64) -> Result<Option<IncomingBatch>> {
        let batch = self
            .conn
            .query_row(
                &format!(
                    "SELECT {INCOMING_COLUMNS} FROM incoming_batch
                     WHERE source_node_id = ?1 AND batch_id = ?2"
                ),
                params![source_node_id, batch_id],
                incoming_from_row,
            )
            .optional()?;
        batch.transpose()
    }

    pub fn transition_incoming(
        &self,
        source_node_id: &str,
        batch_id: i64,
        to: BatchStatus,
        detail: &TransitionDetail,
    ) -> Result<IncomingBatch> {
        let not_found = || RouteError::BatchNotFound {
            node_id: source_node_id.to_string(),
            batch_id,
        };
        let current = self.get_incoming(source_node_id, batch_id)?.ok_or_else(not_found)?;
        if current.status == to {
            return Ok(current);
        }
        if !current.status.can_transition(to) {
            return Err(RouteError::InvalidTransition {
                node_id: source_node_id.to_string(),
                batch_id,
                from: current.status,
                to,
            });
        }
        let stats = detail.stats.unwrap_or(current.load_stats);
        self.conn.execute(
            "UPDATE incoming_batch SET status = ?3, error_detail = COALESCE(?4, error_detail),
                 retry_count = retry_count + ?5, fallback_insert_count = ?6,
                 fallback_update_count = ?7, missing_delete_count = ?8, last_update_time = ?9
             WHERE source_node_id = ?1 AND batch_id = ?2",
            params![
                source_node_id,
                batch_id,
                to.code(),
                detail.error,
                i64::from(detail.increment_retry),
                stats.fallback_insert_count,
                stats.fallback_update_count,
                stats.missing_delete_count,
                self.clock.now(),
            ],
        )?;
        self.get_incoming(source_node_id, batch_id)?.ok_or_else(not_found)
    }
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<Result<BatchStatus>> {
    let code: String = row.get(idx)?;
    Ok(code.parse::<BatchStatus>().map_err(|_| {
        RouteError::Fatal(format!("unknown batch status '{code}' in storage"))
    }))
}

fn outgoing_from_row(row: &Row<'_>) -> rusqlite::Result<Result<OutgoingBatch>> {
    let status = match parse_status(row, 3)? {
        Ok(status) => status,
        Err(err) => return Ok(Err(err)),
    };
    Ok(Ok(OutgoingBatch {
        node_id: row.get(0)?,
        batch_id: row.get(1)?,
        channel_id: row.get(2)?,
        status,
        event_count: row.get(4)?,
        byte_count: row.get(5)?,
        retry_count: row.get(6)?,
        error_detail: row.get(7)?,
        load_stats: LoadStats {
            fallback_insert_count: row.get(8)?,
            fallback_update_count: row.get(9)?,
            missing_delete_count: row.get(10)?,
        },
        create_time: row.get(11)?,
        last_update_time: row.get(12)?,
    }))
}

fn incoming_from_row(row: &Row<'_>) -> rusqlite::Result<Result<IncomingBatch>> {
    let status = match parse_status(row, 3)? {
        Ok(status) => status,
        Err(err) => return Ok(Err(err)),
    };
    Ok(Ok(IncomingBatch {
        source_node_id: row.get(0)?,
        batch_id: row.get(1)?,
        channel_id: row.get(2)?,
        status,
        retry_count: row.get(4)?,
        error_detail: row.get(5)?,
        load_stats: LoadStats {
            fallback_insert_count: row.get(6)?,
            fallback_update_count: row.get(7)?,
            missing_delete_count: row.get(8)?,
        },
        create_time: row.get(9)?,
        last_update_time: row.get(10)?,
    }))
}
