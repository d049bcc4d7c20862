use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{
        bitcoin_pipeline, init_tracing, rpc_client, stored_heights, temp_store,
        wait_for_stored_heights,
    },
    mock_rpc::{MockChain, MockRpcServer},
};
use anyhow::Result;
use protoindex::processor::LiveSettings;
use protoindex::{Gap, GapRetriever, LiveSyncService, Retriever, Telemetry};

fn settings() -> LiveSettings {
    LiveSettings {
        workers: 1,
        buffer_capacity: 16,
        poll_interval: Duration::from_millis(20),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follows_the_tip_and_leaves_history_to_backfill() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(10);
    chain.set_tip_limit(2);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let client = rpc_client(server.url());
    let telemetry = Arc::new(Telemetry::default());

    let mut service = LiveSyncService::new(
        settings(),
        bitcoin_pipeline(client.clone(), &store.db),
        client,
        telemetry.clone(),
    );
    service.start()?;

    wait_for_stored_heights(&store.db, &[2], Duration::from_secs(10)).await?;
    chain.advance_tip_by(1);
    wait_for_stored_heights(&store.db, &[2, 3], Duration::from_secs(10)).await?;
    chain.advance_tip_by(1);
    wait_for_stored_heights(&store.db, &[2, 3, 4], Duration::from_secs(10)).await?;

    service.stop().await?;
    assert!(!service.is_running());
    assert_eq!(telemetry.published_blocks(), 3);
    assert_eq!(telemetry.evicted_payloads(), 0);

    let retriever = GapRetriever::new(store.db.clone());
    assert_eq!(retriever.find_gaps(1)?, vec![Gap::new(0, 1)]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unchanged_tip_is_published_once() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let client = rpc_client(server.url());
    let telemetry = Arc::new(Telemetry::default());

    let mut service = LiveSyncService::new(
        settings(),
        bitcoin_pipeline(client.clone(), &store.db),
        client,
        telemetry.clone(),
    );
    service.start()?;
    wait_for_stored_heights(&store.db, &[2], Duration::from_secs(10)).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    service.stop().await?;

    assert_eq!(telemetry.published_blocks(), 1);
    assert_eq!(stored_heights(&store.db)?, vec![2]);

    server.shutdown().await;
    Ok(())
}
