// ABOUTME: Cluster lock so only one engine instance routes a channel at a time
// ABOUTME: SQLite-backed: rows carry an owner instance id and an expiry

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use rusqlite::params;

use crate::clock::Clock;
use crate::error::Result;

pub trait ClusterLock: Send + Sync {
    /// Takes the named lock. Returns false when another live owner holds it.
    fn try_lock(&self, name: &str) -> Result<bool>;

    fn unlock(&self, name: &str) -> Result<()>;
}

/// Holds a lock until dropped.
pub struct LockGuard {
    lock: Arc<dyn ClusterLock>,
    name: String,
}

impl LockGuard {
    /// `None` when the lock is held elsewhere.
    pub fn acquire(lock: &Arc<dyn ClusterLock>, name: &str) -> Result<Option<Self>> {
        if !lock.try_lock(name)? {
            return Ok(None);
        }
        Ok(Some(Self {
            lock: Arc::clone(lock),
            name: name.to_string(),
        }))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock(&self.name) {
            tracing::warn!(lock = %self.name, error = %err, "failed to release cluster lock");
        }
    }
}

/// Lock rows in the router database, shared by every instance pointing at it.
#[derive(Debug, Clone)]
pub struct SqliteClusterLock {
    path: PathBuf,
    owner: String,
    expiry: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteClusterLock {
    pub fn new(path: impl Into<PathBuf>, expiry: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            owner: uuid::Uuid::new_v4().to_string(),
            expiry,
            clock,
        }
    }
}

impl ClusterLock for SqliteClusterLock {
    fn try_lock(&self, name: &str) -> Result<bool> {
        let conn = crate::db::open(&self.path)?;
        let now = self.clock.now();
        let until = (now + self.expiry).timestamp_millis();
        // an expired lock is taken over; our own lock is extended
        let changed = conn.execute(
            "INSERT INTO cluster_lock(lock_name, owner, lock_time, locked_until)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lock_name) DO UPDATE SET
                 owner = excluded.owner,
                 lock_time = excluded.lock_time,
                 locked_until = excluded.locked_until
             WHERE cluster_lock.owner IS NULL
                OR cluster_lock.owner = excluded.owner
                OR cluster_lock.locked_until < ?5",
            params![name, self.owner, now, until, now.timestamp_millis()],
        )?;
        if changed == 0 {
            tracing::debug!(lock = %name, "cluster lock held by another instance");
        }
        Ok(changed == 1)
    }

    fn unlock(&self, name: &str) -> Result<()> {
        let conn = crate::db::open(&self.path)?;
        conn.execute(
            "UPDATE cluster_lock SET owner = NULL, locked_until = NULL
             WHERE lock_name = ?1 AND owner = ?2",
            params![name, self.owner],
        )?;
        Ok(())
    }
}
