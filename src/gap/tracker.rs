use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{compute_gaps, validate, Gap, GapSnapshot, GapStatus, GapUpdate, OPEN_END};
use crate::clock::Clock;
use crate::error::{Result, RouteError};

/// Persists the gap list of one channel behind an optimistic version check.
pub struct GapTracker<'c> {
    conn: &'c Connection,
    channel_id: String,
    clock: Arc<dyn Clock>,
    grace: Duration,
    max_attempts: u32,
}

impl<'c> GapTracker<'c> {
    pub fn new(
        conn: &'c Connection,
        channel_id: &str,
        clock: Arc<dyn Clock>,
        grace: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            conn,
            channel_id: channel_id.to_string(),
            clock,
            grace,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Loads the current gaps, creating `[0, open)` for a channel never routed before.
    pub fn load(&self) -> Result<GapSnapshot> {
        if let Some(snapshot) = self.peek()? {
            return Ok(snapshot);
        }
        let now = self.clock.now();
        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO gap_checkpoint(channel_id, version, max_seen_id, updated_at)
             VALUES (?1, 0, 0, ?2)
             ON CONFLICT(channel_id) DO NOTHING",
            params![self.channel_id, now],
        )?;
        if inserted == 1 {
            insert_gap(&tx, &self.channel_id, &Gap::new(0, OPEN_END, now))?;
            tracing::info!(channel = %self.channel_id, "initialized gap checkpoint");
        }
        tx.commit()?;
        self.peek()?.ok_or_else(|| {
            RouteError::Fatal(format!("gap checkpoint for {} vanished", self.channel_id))
        })
    }

    /// Reads the persisted gaps without creating anything.
    pub fn peek(&self) -> Result<Option<GapSnapshot>> {
        let checkpoint: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT version, max_seen_id FROM gap_checkpoint WHERE channel_id = ?1",
                [&self.channel_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((version, max_seen_id)) = checkpoint else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT start_id, end_id, status, create_time, last_updated
             FROM data_gap WHERE channel_id = ?1 ORDER BY start_id",
        )?;
        let mut rows = stmt.query([&self.channel_id])?;
        let mut gaps = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(2)?;
            let status = match GapStatus::parse(&status)? {
                // a pass that died mid-scan leaves its gaps in progress
                GapStatus::InProgress => GapStatus::Open,
                other => other,
            };
            gaps.push(Gap {
                start_id: row.get(0)?,
                end_id: row.get(1)?,
                status,
                create_time: row.get(3)?,
                last_updated: row.get(4)?,
            });
        }
        validate(&self.channel_id, &gaps)?;
        Ok(Some(GapSnapshot {
            channel_id: self.channel_id.clone(),
            version,
            max_seen_id,
            gaps,
        }))
    }

    /// Marks every gap of the snapshot as being scanned.
    pub fn begin_pass(&self, snapshot: &GapSnapshot) -> Result<GapSnapshot> {
        let now = self.clock.now();
        let tx = self.conn.unchecked_transaction()?;
        self.bump_version(&tx, snapshot.version, snapshot.max_seen_id, now)?;
        tx.execute(
            "UPDATE data_gap SET status = ?2, last_updated = ?3 WHERE channel_id = ?1",
            params![self.channel_id, GapStatus::InProgress.as_str(), now],
        )?;
        tx.commit()?;

        let mut scanning = snapshot.clone();
        scanning.version += 1;
        for gap in &mut scanning.gaps {
            gap.status = GapStatus::InProgress;
            gap.last_updated = now;
        }
        Ok(scanning)
    }

    /// Returns in-progress gaps to open. Best effort: loading treats both alike.
    pub fn abort_pass(&self) {
        let result = self.conn.execute(
            "UPDATE data_gap SET status = ?2 WHERE channel_id = ?1 AND status = ?3",
            params![
                self.channel_id,
                GapStatus::Open.as_str(),
                GapStatus::InProgress.as_str()
            ],
        );
        if let Err(err) = result {
            tracing::warn!(channel = %self.channel_id, error = %err, "failed to reopen gaps");
        }
    }

    /// Folds the ids processed by a pass into the gap list and persists the result.
    ///
    /// `write_with` runs inside the gap transaction on this tracker's
    /// connection, so whatever it writes commits or rolls back with the gaps.
    /// Retries the read-compute-write cycle when another writer moved the
    /// checkpoint version underneath us.
    pub fn record_pass(
        &self,
        snapshot: &GapSnapshot,
        processed: &BTreeSet<i64>,
        recheck: &mut dyn FnMut(i64, i64) -> Result<i64>,
        write_with: &mut dyn FnMut() -> Result<()>,
    ) -> Result<GapUpdate> {
        let mut current = snapshot.clone();
        let mut attempt = 1;
        loop {
            let now = self.clock.now();
            let update = compute_gaps(
                &current.gaps,
                processed,
                current.max_seen_id,
                now,
                self.grace,
                recheck,
            )?;
            match self.persist(&current, &update, now, write_with) {
                Ok(()) => {
                    for gap in &update.resolved {
                        tracing::warn!(
                            channel = %self.channel_id,
                            start_id = gap.start_id,
                            end_id = gap.end_id,
                            "Skipping data ids {} to {}: gap expired without committed rows",
                            gap.start_id,
                            gap.end_id
                        );
                    }
                    return Ok(update);
                }
                Err(RouteError::Conflict(what)) if attempt < self.max_attempts => {
                    tracing::debug!(
                        channel = %self.channel_id,
                        attempt,
                        "gap checkpoint conflict on {}, retrying",
                        what
                    );
                    attempt += 1;
                    current = self.load()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn persist(
        &self,
        previous: &GapSnapshot,
        update: &GapUpdate,
        now: DateTime<Utc>,
        write_with: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        validate(&self.channel_id, &update.gaps)?;
        let tx = self.conn.unchecked_transaction()?;
        self.bump_version(&tx, previous.version, update.max_seen_id, now)?;

        for gap in update.consumed.iter().chain(update.resolved.iter()) {
            tx.execute(
                "DELETE FROM data_gap WHERE channel_id = ?1 AND start_id = ?2 AND end_id = ?3",
                params![self.channel_id, gap.start_id, gap.end_id],
            )?;
        }
        for gap in &update.gaps {
            let unchanged = previous.gaps.iter().any(|g| g.same_range(gap))
                && !update.consumed.iter().any(|g| g.same_range(gap));
            if unchanged {
                tx.execute(
                    "UPDATE data_gap SET status = ?4, last_updated = ?5
                     WHERE channel_id = ?1 AND start_id = ?2 AND end_id = ?3",
                    params![
                        self.channel_id,
                        gap.start_id,
                        gap.end_id,
                        GapStatus::Open.as_str(),
                        now
                    ],
                )?;
            } else {
                insert_gap(&tx, &self.channel_id, gap)?;
            }
        }
        write_with()?;
        tx.commit()?;
        Ok(())
    }

    fn bump_version(
        &self,
        conn: &Connection,
        expected: i64,
        max_seen_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE gap_checkpoint SET version = version + 1, max_seen_id = ?3, updated_at = ?4
             WHERE channel_id = ?1 AND version = ?2",
            params![self.channel_id, expected, max_seen_id, now],
        )?;
        if updated == 0 {
            return Err(RouteError::Conflict(format!(
                "gap checkpoint of channel {} at version {}",
                self.channel_id, expected
            )));
        }
        Ok(())
    }
}

fn insert_gap(conn: &Connection, channel_id: &str, gap: &Gap) -> Result<()> {
    conn.execute(
        "INSERT INTO data_gap(channel_id, start_id, end_id, status, create_time, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            channel_id,
            gap.start_id,
            gap.end_id,
            GapStatus::Open.as_str(),
            gap.create_time,
            gap.last_updated
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (tempfile::TempDir, Connection, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let conn = crate::db::open(&dir.path().join("router.db")).unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (dir, conn, clock)
    }

    fn ids(values: &[i64]) -> BTreeSet<i64> {
        values.iter().copied().collect()
    }

    fn nothing() -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_first_load_creates_head_gap() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock, Duration::minutes(10), 3);
        let snapshot = tracker.load().unwrap();
        assert_eq!(snapshot.ranges(), vec![(0, OPEN_END)]);
        assert_eq!(snapshot.version, 0);
        // loading again does not add a second head
        assert_eq!(tracker.load().unwrap().gaps.len(), 1);
    }

    #[test]
    fn test_pass_round_trip_persists_gaps() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock.clone(), Duration::minutes(10), 3);
        let snapshot = tracker.begin_pass(&tracker.load().unwrap()).unwrap();
        assert!(snapshot.gaps.iter().all(|g| g.status == GapStatus::InProgress));

        let mut recheck = |_: i64, _: i64| -> Result<i64> { Ok(0) };
        tracker
            .record_pass(&snapshot, &ids(&[1, 2, 4]), &mut recheck, &mut nothing)
            .unwrap();
        let reloaded = tracker.load().unwrap();
        assert_eq!(reloaded.ranges(), vec![(3, 3), (5, OPEN_END)]);
        assert_eq!(reloaded.max_seen_id, 4);
        assert_eq!(reloaded.version, 2);
        assert!(reloaded.gaps.iter().all(|g| g.status == GapStatus::Open));
    }

    #[test]
    fn test_failed_joint_write_leaves_gaps_untouched() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock, Duration::minutes(10), 3);
        let snapshot = tracker.begin_pass(&tracker.load().unwrap()).unwrap();

        let mut recheck = |_: i64, _: i64| -> Result<i64> { Ok(0) };
        let mut failing = || -> Result<()> {
            conn.execute(
                "INSERT INTO batch_sequence(node_id, last_batch_id) VALUES ('store-001', 7)",
                [],
            )?;
            Err(RouteError::Transient("disk went away".to_string()))
        };
        let err = tracker
            .record_pass(&snapshot, &ids(&[1, 2]), &mut recheck, &mut failing)
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Transient);

        tracker.abort_pass();
        let reloaded = tracker.load().unwrap();
        assert_eq!(reloaded.ranges(), vec![(0, OPEN_END)]);
        assert_eq!(reloaded.version, 1);
        let sequences: i64 = conn
            .query_row("SELECT COUNT(*) FROM batch_sequence", [], |r| r.get(0))
            .unwrap();
        assert_eq!(sequences, 0);
    }

    #[test]
    fn test_stale_version_retries_against_fresh_state() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock, Duration::minutes(10), 3);
        let stale = tracker.load().unwrap();
        tracker.begin_pass(&stale).unwrap();

        let mut recheck = |_: i64, _: i64| -> Result<i64> { Ok(0) };
        let update = tracker
            .record_pass(&stale, &ids(&[0, 1]), &mut recheck, &mut nothing)
            .unwrap();
        assert_eq!(update.gaps.last().unwrap().start_id, 2);
        assert_eq!(tracker.load().unwrap().version, 2);
    }

    #[test]
    fn test_conflict_surfaces_when_attempts_exhausted() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock, Duration::minutes(10), 1);
        let stale = tracker.load().unwrap();
        tracker.begin_pass(&stale).unwrap();
        let mut recheck = |_: i64, _: i64| -> Result<i64> { Ok(0) };
        let err = tracker
            .record_pass(&stale, &ids(&[0]), &mut recheck, &mut nothing)
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Conflict);
    }

    #[test]
    fn test_abort_reopens_gaps() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock, Duration::minutes(10), 3);
        let snapshot = tracker.load().unwrap();
        tracker.begin_pass(&snapshot).unwrap();
        tracker.abort_pass();
        let status: String = conn
            .query_row("SELECT status FROM data_gap WHERE channel_id = 'sale'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "OPEN");
    }

    #[test]
    fn test_corrupt_gap_state_is_fatal() {
        let (_dir, conn, clock) = setup();
        let tracker = GapTracker::new(&conn, "sale", clock, Duration::minutes(10), 3);
        tracker.load().unwrap();
        conn.execute(
            "INSERT INTO data_gap(channel_id, start_id, end_id, status, create_time, last_updated)
             VALUES ('sale', 5, 9, 'OPEN', ?1, ?1)",
            [Utc::now()],
        )
        .unwrap();
        let err = tracker.load().unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Fatal);
    }
}
