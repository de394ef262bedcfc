//! SQLite storage shared by the address space and the status cache.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS segments (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    cidr          TEXT NOT NULL UNIQUE,
    network       INTEGER NOT NULL,
    broadcast     INTEGER NOT NULL,
    vlan_id       INTEGER,
    gateway       TEXT,
    dns_primary   TEXT,
    dns_secondary TEXT,
    tags          TEXT NOT NULL DEFAULT '[]',
    description   TEXT,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ip_addresses (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id   INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
    address      TEXT NOT NULL,
    address_num  INTEGER NOT NULL,
    status       TEXT NOT NULL,
    device_id    INTEGER,
    hostname     TEXT,
    mac_address  TEXT,
    notes        TEXT,
    UNIQUE (segment_id, address)
);

CREATE INDEX IF NOT EXISTS idx_ip_addresses_segment ON ip_addresses (segment_id, address_num);

CREATE TABLE IF NOT EXISTS liveness (
    segment_id       INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
    address          TEXT NOT NULL,
    status           TEXT NOT NULL,
    response_time_ms INTEGER,
    mac              TEXT,
    previous_mac     TEXT,
    conflict         INTEGER NOT NULL DEFAULT 0,
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (segment_id, address)
);
";

/// Cloneable handle to a single SQLite connection. Callers hold the lock for
/// one statement or one transaction.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let db = Self::init(conn)?;
        debug!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection, ignoring poisoning.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
