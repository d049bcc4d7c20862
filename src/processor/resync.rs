//! Operator-driven re-ingestion of explicit height ranges.

use crate::index::cleaner::{Cleaner, DataScope};
use crate::index::gaps::{height_bins, Gap};
use crate::processor::pipeline::ChainPipeline;
use crate::processor::worker_pool::{BinWorkerPool, PoolReport};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Knobs of one resync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncSettings {
    pub ranges: Vec<Gap>,
    pub batch_size: usize,
    pub workers: usize,
    /// Delete the stored data of every range before re-ingesting it.
    pub clear_old_cache: bool,
    /// Zero the validation counter of every range before re-ingesting it.
    pub reset_validation: bool,
    pub scope: DataScope,
}

pub struct ResyncService<P: ChainPipeline> {
    settings: ResyncSettings,
    pipeline: Arc<P>,
    cleaner: Arc<dyn Cleaner>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl<P: ChainPipeline> ResyncService<P> {
    pub fn new(
        settings: ResyncSettings,
        pipeline: Arc<P>,
        cleaner: Arc<dyn Cleaner>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            settings,
            pipeline,
            cleaner,
            telemetry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token ends the run after the bins currently in flight.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Prepares the ranges, runs exactly one pool pass over them, and returns.
    pub async fn run(&self) -> Result<PoolReport> {
        let ranges = valid_ranges(&self.settings.ranges);
        if ranges.is_empty() {
            tracing::warn!("resync has no valid ranges; nothing to do");
            return Ok(PoolReport::default());
        }

        if self.settings.reset_validation {
            let cleaner = self.cleaner.clone();
            let targets = ranges.clone();
            tokio::task::spawn_blocking(move || cleaner.reset_validation(&targets))
                .await
                .context("reset task did not complete")?
                .context("failed to reset validation levels")?;
            tracing::info!(ranges = ranges.len(), "validation levels reset");
        }

        if self.settings.clear_old_cache {
            let cleaner = self.cleaner.clone();
            let targets = ranges.clone();
            let scope = self.settings.scope;
            tokio::task::spawn_blocking(move || cleaner.clean(&targets, scope))
                .await
                .context("clean task did not complete")?
                .with_context(|| format!("failed to clean {scope} data"))?;
            tracing::info!(ranges = ranges.len(), %scope, "old data cleared");
        }

        let mut pool = BinWorkerPool::new(
            self.pipeline.clone(),
            self.telemetry.clone(),
            self.shutdown.child_token(),
        );
        pool.start(self.settings.workers)?;
        'queue: for range in &ranges {
            let bins = match height_bins(range.start, range.stop, self.settings.batch_size) {
                Ok(bins) => bins,
                Err(err) => {
                    tracing::error!(start = range.start, stop = range.stop, error = %err, "cannot bin range");
                    continue;
                }
            };
            tracing::info!(start = range.start, stop = range.stop, bins = bins.len(), "resyncing range");
            for bin in bins {
                if let Err(err) = pool.submit(bin) {
                    tracing::error!(error = %err, "failed to queue bin");
                    break 'queue;
                }
            }
        }

        let report = pool.drain_and_stop().await;
        tracing::info!(
            bins = report.bins,
            heights = report.heights,
            published = report.published,
            failures = report.failures,
            "resync complete"
        );
        Ok(report)
    }
}

/// Drops inverted ranges with an error log; the rest are kept in order.
fn valid_ranges(ranges: &[Gap]) -> Vec<Gap> {
    ranges
        .iter()
        .filter(|range| {
            if range.stop < range.start {
                tracing::error!(
                    start = range.start,
                    stop = range.stop,
                    "resync range stop precedes start; skipping"
                );
                return false;
            }
            true
        })
        .copied()
        .collect()
}
