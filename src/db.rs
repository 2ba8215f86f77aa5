// ABOUTME: SQLite connection setup and the router's runtime schema
// ABOUTME: Gap checkpoints, batches, batch sequences and cluster locks live here

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS gap_checkpoint (
    channel_id    TEXT PRIMARY KEY,
    version       INTEGER NOT NULL DEFAULT 0,
    max_seen_id   INTEGER NOT NULL DEFAULT 0,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_gap (
    channel_id    TEXT NOT NULL,
    start_id      INTEGER NOT NULL,
    end_id        INTEGER NOT NULL,
    status        TEXT NOT NULL,
    create_time   TEXT NOT NULL,
    last_updated  TEXT NOT NULL,
    PRIMARY KEY (channel_id, start_id)
);

CREATE TABLE IF NOT EXISTS batch_sequence (
    node_id        TEXT PRIMARY KEY,
    last_batch_id  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outgoing_batch (
    node_id                TEXT NOT NULL,
    batch_id               INTEGER NOT NULL,
    channel_id             TEXT NOT NULL,
    status                 TEXT NOT NULL,
    event_count            INTEGER NOT NULL DEFAULT 0,
    byte_count             INTEGER NOT NULL DEFAULT 0,
    retry_count            INTEGER NOT NULL DEFAULT 0,
    error_detail           TEXT,
    fallback_insert_count  INTEGER NOT NULL DEFAULT 0,
    fallback_update_count  INTEGER NOT NULL DEFAULT 0,
    missing_delete_count   INTEGER NOT NULL DEFAULT 0,
    create_time            TEXT NOT NULL,
    last_update_time       TEXT NOT NULL,
    PRIMARY KEY (node_id, batch_id)
);

CREATE INDEX IF NOT EXISTS outgoing_batch_status ON outgoing_batch(node_id, status);

CREATE TABLE IF NOT EXISTS outgoing_batch_data (
    node_id    TEXT NOT NULL,
    batch_id   INTEGER NOT NULL,
    position   INTEGER NOT NULL,
    data_id    INTEGER NOT NULL,
    router_id  TEXT NOT NULL,
    PRIMARY KEY (node_id, batch_id, position)
);

CREATE TABLE IF NOT EXISTS incoming_batch (
    source_node_id         TEXT NOT NULL,
    batch_id               INTEGER NOT NULL,
    channel_id             TEXT NOT NULL,
    status                 TEXT NOT NULL,
    retry_count            INTEGER NOT NULL DEFAULT 0,
    error_detail           TEXT,
    fallback_insert_count  INTEGER NOT NULL DEFAULT 0,
    fallback_update_count  INTEGER NOT NULL DEFAULT 0,
    missing_delete_count   INTEGER NOT NULL DEFAULT 0,
    create_time            TEXT NOT NULL,
    last_update_time       TEXT NOT NULL,
    PRIMARY KEY (source_node_id, batch_id)
);

CREATE TABLE IF NOT EXISTS cluster_lock (
    lock_name     TEXT PRIMARY KEY,
    owner         TEXT,
    lock_time     TEXT,
    locked_until  INTEGER
);
"#;

/// Opens a connection with WAL journaling and the router schema in place.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal").ok();
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
