use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{
        assert_is_contiguous, bitcoin_pipeline, init_tracing, rpc_client, stored_heights,
        temp_store, validation_at, wait_for_stored_heights,
    },
    mock_rpc::{MockChain, MockRpcServer},
};
use anyhow::Result;
use protoindex::processor::{process_bin, BackfillSettings};
use protoindex::{BackfillService, GapRetriever, Retriever, Telemetry};

fn settings(frequency: Duration, validation_level: u32) -> BackfillSettings {
    BackfillSettings {
        batch_size: 2,
        workers: 2,
        frequency,
        validation_level,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_pass_fills_structural_holes() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(8);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let pipeline = bitcoin_pipeline(rpc_client(server.url()), &store.db);
    let telemetry = Arc::new(Telemetry::default());

    process_bin(pipeline.as_ref(), &telemetry, 0, &[0, 1]).await;
    process_bin(pipeline.as_ref(), &telemetry, 0, &[5]).await;
    process_bin(pipeline.as_ref(), &telemetry, 0, &[7]).await;
    assert_eq!(stored_heights(&store.db)?, vec![0, 1, 5, 7]);

    let retriever = Arc::new(GapRetriever::new(store.db.clone()));
    let service = BackfillService::new(
        settings(Duration::from_secs(3600), 1),
        pipeline,
        retriever.clone(),
        telemetry.clone(),
    );
    let report = service.run_once().await?;

    assert_eq!(report.heights, 4);
    assert_eq!(report.published, 4);
    assert_eq!(report.failures, 0);
    assert_eq!(telemetry.snapshot().gaps_found, 2);
    let heights = stored_heights(&store.db)?;
    assert_eq!(heights, (0..=7u64).collect::<Vec<_>>());
    assert_is_contiguous(&heights);
    assert!(retriever.find_gaps(1)?.is_empty());

    // Nothing left to do on the next pass.
    let report = service.run_once().await?;
    assert_eq!(report.bins, 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raised_threshold_reingests_every_stored_height() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(4);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let pipeline = bitcoin_pipeline(rpc_client(server.url()), &store.db);
    let telemetry = Arc::new(Telemetry::default());
    process_bin(pipeline.as_ref(), &telemetry, 0, &[0, 1, 2, 3]).await;

    let service = BackfillService::new(
        settings(Duration::from_secs(3600), 2),
        pipeline,
        Arc::new(GapRetriever::new(store.db.clone())),
        telemetry,
    );
    let report = service.run_once().await?;
    assert_eq!(report.published, 4);

    for height in 0..4 {
        assert_eq!(validation_at(&store.db, height)?[0].times_validated, 2);
    }
    assert_eq!(service.run_once().await?.bins, 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn periodic_backfill_fills_initial_gap_until_stopped() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let pipeline = bitcoin_pipeline(rpc_client(server.url()), &store.db);
    let telemetry = Arc::new(Telemetry::default());
    process_bin(pipeline.as_ref(), &telemetry, 0, &[4]).await;

    let mut service = BackfillService::new(
        settings(Duration::from_millis(50), 1),
        pipeline,
        Arc::new(GapRetriever::new(store.db.clone())),
        telemetry.clone(),
    );
    service.start()?;
    assert!(service.is_running());

    wait_for_stored_heights(&store.db, &[0, 1, 2, 3, 4], Duration::from_secs(10)).await?;
    service.stop().await?;
    service.stop().await?;
    assert!(!service.is_running());

    // The tip above the highest stored height is live sync's job.
    assert_eq!(stored_heights(&store.db)?, vec![0, 1, 2, 3, 4]);
    assert_eq!(telemetry.published_blocks(), 5);

    server.shutdown().await;
    Ok(())
}
