use std::time::Duration;

use crate::support::{
    helpers::{
        bitcoin_pipeline, init_tracing, rpc_client, stored_heights, wait_for_stored_heights,
        NODE_ID,
    },
    mock_rpc::{MockChain, MockRpcServer},
};
use anyhow::{Context, Result};
use bitcoin::Network;
use protoindex::processor::process_bin;
use protoindex::{
    DataScope, Database, DatabaseOptions, Gap, IndexerConfig, Mode, ResyncConfig,
    ResyncConfigParams, Runner, Telemetry,
};
use tokio::time::timeout;

fn config(url: &str, database_path: std::path::PathBuf) -> Result<IndexerConfig> {
    IndexerConfig::builder()
        .rpc_url(url)
        .node_id(NODE_ID)
        .network(Network::Regtest)
        .database_path(database_path)
        .backfill_frequency(Duration::from_millis(50))
        .batch_size(2)
        .workers(2)
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resync_mode_exits_once_ranges_are_done() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(5);
    let server = MockRpcServer::start(chain.clone()).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("index.sqlite");

    let resync = ResyncConfig::new(ResyncConfigParams {
        ranges: vec![Gap::new(0, 4)],
        batch_size: 2,
        workers: 2,
        clear_old_cache: true,
        reset_validation: true,
        scope: DataScope::Full,
        http_timeout: Duration::from_secs(5),
    })?;
    let mut runner = Runner::new(config(server.url(), path.clone())?).with_resync(resync);
    timeout(Duration::from_secs(20), runner.run_until_ctrl_c(Mode::Resync))
        .await
        .context("resync runner did not exit")??;

    assert_eq!(runner.telemetry().published_blocks(), 5);
    let db = Database::open(&path, DatabaseOptions::default(), NODE_ID)?;
    assert_eq!(stored_heights(&db)?, vec![0, 1, 2, 3, 4]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resync_mode_requires_ranges() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut runner = Runner::new(config("http://127.0.0.1:1", dir.path().join("index.sqlite"))?);

    let err = runner
        .run_until_ctrl_c(Mode::Resync)
        .await
        .expect_err("resync without ranges must fail");
    assert!(format!("{err:#}").contains("resync configuration"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_mode_runs_until_cancelled() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(5);
    let server = MockRpcServer::start(chain.clone()).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("index.sqlite");

    let db = Database::open(&path, DatabaseOptions::default(), NODE_ID)?;
    let seed = bitcoin_pipeline(rpc_client(server.url()), &db);
    process_bin(seed.as_ref(), &Telemetry::default(), 0, &[4]).await;

    let mut runner = Runner::new(config(server.url(), path.clone())?);
    let token = runner.cancellation_token();
    let task = tokio::spawn(async move { runner.run_until_ctrl_c(Mode::Backfill).await });

    wait_for_stored_heights(&db, &[0, 1, 2, 3, 4], Duration::from_secs(20)).await?;
    token.cancel();
    timeout(Duration::from_secs(10), task)
        .await
        .context("backfill runner did not stop")???;

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_mode_follows_the_tip_until_cancelled() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    chain.set_tip_limit(3);
    let server = MockRpcServer::start(chain.clone()).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("index.sqlite");

    let config = IndexerConfig::builder()
        .rpc_url(server.url())
        .node_id(NODE_ID)
        .network(Network::Regtest)
        .database_path(path.clone())
        .head_poll_interval(Duration::from_millis(20))
        .build()?;
    let mut runner = Runner::new(config);
    let token = runner.cancellation_token();
    let task = tokio::spawn(async move { runner.run_until_ctrl_c(Mode::Sync).await });

    let db = Database::open(&path, DatabaseOptions::default(), NODE_ID)?;
    wait_for_stored_heights(&db, &[3], Duration::from_secs(20)).await?;
    chain.advance_tip_by(1);
    wait_for_stored_heights(&db, &[3, 4], Duration::from_secs(20)).await?;
    token.cancel();
    timeout(Duration::from_secs(10), task)
        .await
        .context("sync runner did not stop")???;

    server.shutdown().await;
    Ok(())
}
