use std::sync::Arc;

use crate::support::{
    helpers::{
        bitcoin_pipeline, count_rows, init_tracing, rpc_client, stored_heights, temp_store,
        validation_at,
    },
    mock_rpc::{MockChain, MockRpcServer},
};
use anyhow::Result;
use protoindex::processor::{process_bin, ResyncSettings};
use protoindex::{DataScope, Gap, IpldCleaner, ResyncService, Telemetry};

fn settings(
    ranges: Vec<Gap>,
    clear_old_cache: bool,
    reset_validation: bool,
    scope: DataScope,
) -> ResyncSettings {
    ResyncSettings {
        ranges,
        batch_size: 2,
        workers: 2,
        clear_old_cache,
        reset_validation,
        scope,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_clean_reingests_range_from_scratch() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(5);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let pipeline = bitcoin_pipeline(rpc_client(server.url()), &store.db);
    let telemetry = Arc::new(Telemetry::default());
    process_bin(pipeline.as_ref(), &telemetry, 0, &[0, 1, 2, 3, 4]).await;
    process_bin(pipeline.as_ref(), &telemetry, 0, &[1, 2, 3]).await;

    let service = ResyncService::new(
        settings(vec![Gap::new(1, 3)], true, true, DataScope::Full),
        pipeline,
        Arc::new(IpldCleaner::new(store.db.clone())),
        telemetry,
    );
    let report = service.run().await?;
    assert_eq!(report.heights, 3);
    assert_eq!(report.published, 3);
    assert_eq!(report.failures, 0);

    assert_eq!(stored_heights(&store.db)?, vec![0, 1, 2, 3, 4]);
    for height in 1..=3 {
        assert_eq!(validation_at(&store.db, height)?[0].times_validated, 1);
    }
    assert_eq!(validation_at(&store.db, 0)?[0].times_validated, 1);
    assert_eq!(count_rows(&store.db, "transaction_cids")?, 5);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transactions_only_clean_keeps_headers_counting() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let pipeline = bitcoin_pipeline(rpc_client(server.url()), &store.db);
    let telemetry = Arc::new(Telemetry::default());
    process_bin(pipeline.as_ref(), &telemetry, 0, &[0, 1, 2]).await;

    let service = ResyncService::new(
        settings(vec![Gap::new(0, 2)], true, false, DataScope::TransactionsOnly),
        pipeline,
        Arc::new(IpldCleaner::new(store.db.clone())),
        telemetry,
    );
    assert_eq!(service.run().await?.published, 3);

    for height in 0..=2 {
        assert_eq!(validation_at(&store.db, height)?[0].times_validated, 2);
    }
    assert_eq!(count_rows(&store.db, "header_cids")?, 3);
    assert_eq!(count_rows(&store.db, "transaction_cids")?, 3);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inverted_ranges_are_skipped() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(4);
    let server = MockRpcServer::start(chain.clone()).await?;
    let store = temp_store();
    let pipeline = bitcoin_pipeline(rpc_client(server.url()), &store.db);

    let service = ResyncService::new(
        settings(
            vec![Gap::new(3, 1), Gap::new(2, 3)],
            false,
            false,
            DataScope::Full,
        ),
        pipeline,
        Arc::new(IpldCleaner::new(store.db.clone())),
        Arc::new(Telemetry::default()),
    );
    let report = service.run().await?;
    assert_eq!(report.published, 2);
    assert_eq!(stored_heights(&store.db)?, vec![2, 3]);

    server.shutdown().await;
    Ok(())
}
