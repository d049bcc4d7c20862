use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use bitcoin::Network;
use once_cell::sync::Lazy;
use protoindex::index::HeaderValidation;
use protoindex::rpc::RpcClientOptions;
use protoindex::{
    AsyncRpcClient, BitcoinConverter, BitcoinPipeline, Database, DatabaseOptions, GapRetriever,
    IpldPublisher,
};
use tempfile::TempDir;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

pub const NODE_ID: &str = "regtest-node";

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// A store in its own temp directory, removed on drop.
pub struct TempStore {
    _dir: TempDir,
    pub db: Database,
}

pub fn temp_store() -> TempStore {
    let dir = tempfile::tempdir().expect("temp dir must be created");
    let db = Database::open(
        dir.path().join("index.sqlite"),
        DatabaseOptions::default(),
        NODE_ID,
    )
    .expect("store must open");
    TempStore { _dir: dir, db }
}

pub fn fast_rpc_options() -> RpcClientOptions {
    RpcClientOptions {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        ..RpcClientOptions::default()
    }
}

pub fn rpc_client(url: &str) -> Arc<AsyncRpcClient> {
    Arc::new(
        AsyncRpcClient::with_options(url, "", "", fast_rpc_options())
            .expect("mock RPC client must build"),
    )
}

pub fn bitcoin_pipeline(client: Arc<AsyncRpcClient>, db: &Database) -> Arc<BitcoinPipeline> {
    Arc::new(BitcoinPipeline::new(
        client,
        Arc::new(BitcoinConverter::new(Network::Regtest)),
        Arc::new(IpldPublisher::new(db.clone())),
    ))
}

/// Distinct stored header heights, ascending.
pub fn stored_heights(db: &Database) -> Result<Vec<u64>> {
    let conn = db.conn()?;
    let mut stmt =
        conn.prepare("SELECT DISTINCT block_number FROM header_cids ORDER BY block_number")?;
    let heights = stmt
        .query_map([], |row| row.get::<_, i64>(0).map(|height| height as u64))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(heights)
}

pub fn count_rows(db: &Database, table: &str) -> Result<i64> {
    let conn = db.conn()?;
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count)
}

pub fn validation_at(db: &Database, height: u64) -> Result<Vec<HeaderValidation>> {
    Ok(GapRetriever::new(db.clone()).validation_levels(height, height)?)
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{what} did not happen within {timeout:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_stored_heights(db: &Database, expected: &[u64], timeout: Duration) -> Result<()> {
    wait_until("store to hold the expected heights", timeout, move || async move {
        Ok(stored_heights(db)? == expected)
    })
    .await
    .map_err(|err| {
        let current = stored_heights(db).unwrap_or_default();
        err.context(format!("expected {expected:?}, store holds {current:?}"))
    })
}

pub fn assert_is_contiguous(heights: &[u64]) {
    for window in heights.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "heights must increase monotonically");
        }
    }
}
