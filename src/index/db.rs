//! SQLite-backed store holding the relational index and the content blobs.
//!
//! Every worker checks its own connection out of an `r2d2` pool and opens its own
//! transaction per publish/clean call. WAL mode lets readers proceed while a
//! single writer holds the lock; `busy_timeout` makes concurrent writers queue
//! instead of failing.

use crate::index::error::IndexResult;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_OPEN_CONNECTIONS: u32 = 8;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub type PooledSqlite = PooledConnection<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS header_cids (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    block_number INTEGER NOT NULL,
    block_hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    cid TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    bits INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    mh_key TEXT NOT NULL,
    times_validated INTEGER NOT NULL DEFAULT 1,
    UNIQUE (block_number, block_hash)
);
CREATE INDEX IF NOT EXISTS idx_header_cids_block_number ON header_cids(block_number);
CREATE INDEX IF NOT EXISTS idx_header_cids_mh_key ON header_cids(mh_key);

CREATE TABLE IF NOT EXISTS transaction_cids (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    header_id INTEGER NOT NULL REFERENCES header_cids(id) ON DELETE CASCADE,
    tx_hash TEXT NOT NULL,
    tx_index INTEGER NOT NULL,
    cid TEXT NOT NULL,
    segwit INTEGER NOT NULL,
    witness_hash TEXT,
    mh_key TEXT NOT NULL,
    UNIQUE (header_id, tx_hash)
);
CREATE INDEX IF NOT EXISTS idx_transaction_cids_header_id ON transaction_cids(header_id);
CREATE INDEX IF NOT EXISTS idx_transaction_cids_mh_key ON transaction_cids(mh_key);

CREATE TABLE IF NOT EXISTS tx_inputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL REFERENCES transaction_cids(id) ON DELETE CASCADE,
    input_index INTEGER NOT NULL,
    witness TEXT NOT NULL,
    sig_script BLOB NOT NULL,
    outpoint_tx_hash TEXT NOT NULL,
    outpoint_index INTEGER NOT NULL,
    UNIQUE (tx_id, input_index)
);

CREATE TABLE IF NOT EXISTS tx_outputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL REFERENCES transaction_cids(id) ON DELETE CASCADE,
    output_index INTEGER NOT NULL,
    value INTEGER NOT NULL,
    pk_script BLOB NOT NULL,
    script_class INTEGER NOT NULL,
    addresses TEXT NOT NULL,
    required_sigs INTEGER NOT NULL,
    UNIQUE (tx_id, output_index)
);
";

/// Connection pool limits for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseOptions {
    pub max_open: u32,
    pub min_idle: Option<u32>,
    pub max_lifetime: Option<Duration>,
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN_CONNECTIONS,
            min_idle: None,
            max_lifetime: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Shared handle to the store. Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    node_id: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("node_id", &self.node_id)
            .field("state", &self.pool.state())
            .finish()
    }
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )
}

impl Database {
    /// Opens (creating if needed) the store at `path` and applies the schema.
    pub fn open(
        path: impl AsRef<Path>,
        options: DatabaseOptions,
        node_id: impl Into<String>,
    ) -> IndexResult<Self> {
        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_init(move |conn| configure_connection(conn, busy_timeout));
        let pool = Pool::builder()
            .max_size(options.max_open.max(1))
            .min_idle(options.min_idle)
            .max_lifetime(options.max_lifetime)
            .build(manager)?;

        let db = Self {
            pool,
            node_id: node_id.into(),
        };
        db.init_schema()?;
        tracing::info!(
            path = %path.as_ref().display(),
            max_open = options.max_open,
            "index store ready"
        );
        Ok(db)
    }

    fn init_schema(&self) -> IndexResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Checks a connection out of the pool.
    pub fn conn(&self) -> IndexResult<PooledSqlite> {
        Ok(self.pool.get()?)
    }

    /// Identifier of the node whose data this process ingests.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}
