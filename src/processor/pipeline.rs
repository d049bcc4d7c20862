//! Chain capability seam driven by every ingestion mode, plus the per-bin
//! fetch → convert → publish routine shared by the worker pools.

use crate::chain::converter::Converter;
use crate::chain::types::{ConvertedPayload, RawBlock};
use crate::index::publisher::Publisher;
use crate::rpc::Fetcher;
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Fetcher, converter, and publisher of one chain, bundled behind one seam.
///
/// Implementations are chosen when a service is constructed; the worker pools
/// only ever see this trait.
pub trait ChainPipeline: Send + Sync + 'static {
    type Raw: Send + 'static;
    type Payload: Send + 'static;

    /// Fetches the blocks at `heights`. Heights the node cannot serve are
    /// simply absent from the result.
    fn fetch<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<Self::Raw>>>;

    fn raw_height(&self, raw: &Self::Raw) -> u64;

    fn payload_height(&self, payload: &Self::Payload) -> u64;

    fn convert(&self, raw: Self::Raw) -> Result<Self::Payload>;

    /// Commits one payload. Resolves only after the store has committed or rolled back.
    fn publish(&self, payload: Self::Payload) -> BoxFuture<'_, Result<()>>;
}

/// Bitcoin pipeline: node RPC fetcher, script-decoding converter, IPLD publisher.
pub struct BitcoinPipeline {
    fetcher: Arc<dyn Fetcher>,
    converter: Arc<dyn Converter>,
    publisher: Arc<dyn Publisher>,
}

impl BitcoinPipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        converter: Arc<dyn Converter>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            fetcher,
            converter,
            publisher,
        }
    }
}

impl ChainPipeline for BitcoinPipeline {
    type Raw = RawBlock;
    type Payload = ConvertedPayload;

    fn fetch<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<RawBlock>>> {
        self.fetcher.fetch_at(heights)
    }

    fn raw_height(&self, raw: &RawBlock) -> u64 {
        raw.height
    }

    fn payload_height(&self, payload: &ConvertedPayload) -> u64 {
        payload.height()
    }

    fn convert(&self, raw: RawBlock) -> Result<ConvertedPayload> {
        self.converter.convert(raw)
    }

    fn publish(&self, payload: ConvertedPayload) -> BoxFuture<'_, Result<()>> {
        let publisher = Arc::clone(&self.publisher);
        async move {
            let height = payload.height();
            // The store is synchronous; keep it off the async workers.
            tokio::task::spawn_blocking(move || publisher.publish(&payload))
                .await
                .with_context(|| format!("publish task for height {height} did not complete"))?
                .with_context(|| format!("failed to publish block at height {height}"))
        }
        .boxed()
    }
}

/// What happened to the heights of one bin.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BinOutcome {
    pub heights: usize,
    pub published: usize,
    pub failures: usize,
}

/// Runs one bin to completion, strictly in order. Per-height failures are
/// logged and counted, and never stop the remaining heights.
pub async fn process_bin<P: ChainPipeline>(
    pipeline: &P,
    telemetry: &Telemetry,
    worker: usize,
    bin: &[u64],
) -> BinOutcome {
    let mut outcome = BinOutcome {
        heights: bin.len(),
        ..BinOutcome::default()
    };
    let (Some(&start), Some(&stop)) = (bin.first(), bin.last()) else {
        return outcome;
    };

    let raws = match pipeline.fetch(bin).await {
        Ok(raws) => raws,
        Err(err) => {
            tracing::error!(worker, start, stop, error = %err, "failed to fetch bin");
            telemetry.record_fetch_failures(bin.len() as u64);
            outcome.failures = bin.len();
            return outcome;
        }
    };

    let missing = bin.len().saturating_sub(raws.len());
    if missing > 0 {
        tracing::warn!(worker, start, stop, missing, "node did not return every requested height");
        telemetry.record_fetch_failures(missing as u64);
        outcome.failures += missing;
    }

    for raw in raws {
        let height = pipeline.raw_height(&raw);
        let payload = match pipeline.convert(raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(worker, height, error = %err, "conversion failed");
                telemetry.record_convert_failure();
                outcome.failures += 1;
                continue;
            }
        };

        match pipeline.publish(payload).await {
            Ok(()) => {
                telemetry.record_published_block();
                outcome.published += 1;
            }
            Err(err) => {
                tracing::error!(worker, height, error = %err, "publish failed");
                telemetry.record_publish_failure();
                outcome.failures += 1;
            }
        }
    }

    tracing::debug!(
        worker,
        start,
        stop,
        published = outcome.published,
        failures = outcome.failures,
        "bin processed"
    );
    outcome
}
