//! Periodic gap backfill.
//!
//! Every tick scans the index for gaps, splits them into bins, and runs one
//! closed worker-pool pass over them. Passes never overlap: the next tick is
//! only awaited after the previous cohort has been drained and joined.

use crate::index::gaps::gaps_to_bins;
use crate::index::retriever::Retriever;
use crate::processor::pipeline::ChainPipeline;
use crate::processor::worker_pool::{BinWorkerPool, PoolReport};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Knobs of one backfill service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSettings {
    pub batch_size: usize,
    pub workers: usize,
    pub frequency: Duration,
    pub validation_level: u32,
}

pub struct BackfillService<P: ChainPipeline> {
    inner: Arc<BackfillInner<P>>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct BackfillInner<P: ChainPipeline> {
    settings: BackfillSettings,
    pipeline: Arc<P>,
    retriever: Arc<dyn Retriever>,
    telemetry: Arc<Telemetry>,
}

impl<P: ChainPipeline> BackfillService<P> {
    pub fn new(
        settings: BackfillSettings,
        pipeline: Arc<P>,
        retriever: Arc<dyn Retriever>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            inner: Arc::new(BackfillInner {
                settings,
                pipeline,
                retriever,
                telemetry,
            }),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawns the ticker loop. Calling it while already running is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move {
            inner.run(shutdown).await;
        }));
        tracing::info!(
            workers = self.inner.settings.workers,
            batch_size = self.inner.settings.batch_size,
            frequency_secs = self.inner.settings.frequency.as_secs_f64(),
            "backfill started"
        );
        Ok(())
    }

    /// Requests shutdown and waits for the in-flight pass to finish its
    /// current bins. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.await.context("backfill task failed")?;
        tracing::info!("backfill stopped");
        Ok(())
    }

    /// Runs a single scan-and-fill pass on the caller's task.
    pub async fn run_once(&self) -> Result<PoolReport> {
        self.inner.pass(&self.shutdown).await
    }
}

impl<P: ChainPipeline> BackfillInner<P> {
    async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.settings.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.pass(&shutdown).await {
                Ok(report) if report.bins > 0 => tracing::info!(
                    bins = report.bins,
                    heights = report.heights,
                    published = report.published,
                    failures = report.failures,
                    "backfill pass complete"
                ),
                Ok(_) => tracing::debug!("backfill pass found nothing to do"),
                // Scan failures only cost this tick.
                Err(err) => tracing::error!(error = %err, "backfill pass failed"),
            }
        }
    }

    async fn pass(&self, shutdown: &CancellationToken) -> Result<PoolReport> {
        let retriever = self.retriever.clone();
        let threshold = self.settings.validation_level;
        let gaps = tokio::task::spawn_blocking(move || retriever.find_gaps(threshold))
            .await
            .context("gap scan task did not complete")?
            .context("gap scan failed")?;
        if gaps.is_empty() {
            return Ok(PoolReport::default());
        }
        self.telemetry.record_gaps_found(gaps.len() as u64);
        for gap in &gaps {
            tracing::info!(start = gap.start, stop = gap.stop, "backfilling gap");
        }

        let bins = gaps_to_bins(&gaps, self.settings.batch_size);
        let mut pool = BinWorkerPool::new(
            self.pipeline.clone(),
            self.telemetry.clone(),
            shutdown.child_token(),
        );
        pool.start(self.settings.workers)?;
        for bin in bins {
            if let Err(err) = pool.submit(bin) {
                tracing::error!(error = %err, "failed to queue bin");
                break;
            }
        }
        Ok(pool.drain_and_stop().await)
    }
}
