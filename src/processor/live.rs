//! Live head-following sync.
//!
//! One producer task polls the node tip, converts each new head block, and
//! pushes it into a [`LatestWinsBuffer`]. A small pool of publish workers
//! drains the buffer. Shutdown is honoured between payloads, never inside a
//! publish.

use crate::chain::types::RawBlock;
use crate::processor::pipeline::ChainPipeline;
use crate::processor::ring_buffer::LatestWinsBuffer;
use crate::processor::streamer::HeadStreamer;
use crate::processor::worker_pool::panic_message;
use crate::rpc::HeadSource;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSettings {
    pub workers: usize,
    pub buffer_capacity: usize,
    pub poll_interval: Duration,
}

pub struct LiveSyncService<P: ChainPipeline<Raw = RawBlock>> {
    settings: LiveSettings,
    pipeline: Arc<P>,
    source: Arc<dyn HeadSource>,
    telemetry: Arc<Telemetry>,
    buffer: Arc<LatestWinsBuffer<P::Payload>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<P: ChainPipeline<Raw = RawBlock>> LiveSyncService<P> {
    pub fn new(
        settings: LiveSettings,
        pipeline: Arc<P>,
        source: Arc<dyn HeadSource>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            buffer: Arc::new(LatestWinsBuffer::new(settings.buffer_capacity)),
            settings,
            pipeline,
            source,
            telemetry,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawns the producer and the publish workers. No-op while running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }
        if self.buffer.is_closed() {
            self.buffer = Arc::new(LatestWinsBuffer::new(self.settings.buffer_capacity));
        }

        let streamer = HeadStreamer::new(self.source.clone(), self.settings.poll_interval);
        self.tasks.push(spawn_isolated(
            "head producer",
            produce(
                streamer,
                self.pipeline.clone(),
                self.buffer.clone(),
                self.telemetry.clone(),
                self.shutdown.clone(),
            ),
        ));

        let workers = self.settings.workers.max(1);
        for worker_id in 0..workers {
            self.tasks.push(spawn_isolated(
                "publish worker",
                publish_loop(
                    worker_id,
                    self.pipeline.clone(),
                    self.buffer.clone(),
                    self.telemetry.clone(),
                    self.shutdown.clone(),
                ),
            ));
        }

        tracing::info!(
            workers,
            buffer_capacity = self.buffer.capacity(),
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "live sync started"
        );
        Ok(())
    }

    /// Cancels every task and waits for in-flight publishes to commit.
    /// Pending payloads still in the buffer are dropped. Safe to call twice.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.buffer.close();
        if self.tasks.is_empty() {
            return Ok(());
        }
        for handle in self.tasks.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "live sync task failed to join");
            }
        }
        tracing::info!(evicted = self.buffer.evicted(), "live sync stopped");
        Ok(())
    }

    pub fn buffer(&self) -> Arc<LatestWinsBuffer<P::Payload>> {
        self.buffer.clone()
    }
}

fn spawn_isolated<F>(role: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic_payload) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
            let panic_msg = panic_message(panic_payload.as_ref());
            tracing::error!(role, panic = %panic_msg, "live sync task panicked");
        }
    })
}

async fn produce<P: ChainPipeline<Raw = RawBlock>>(
    mut streamer: HeadStreamer,
    pipeline: Arc<P>,
    buffer: Arc<LatestWinsBuffer<P::Payload>>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(streamer.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let polled = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            polled = streamer.poll_once() => polled,
        };
        let raw = match polled {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "head poll failed; retrying next interval");
                continue;
            }
        };

        let height = raw.height;
        let payload = match pipeline.convert(raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(height, error = %err, "conversion failed");
                telemetry.record_convert_failure();
                continue;
            }
        };

        if let Some(evicted) = buffer.push(payload).await {
            telemetry.record_evicted_payload();
            tracing::warn!(
                height,
                evicted = pipeline.payload_height(&evicted),
                "live buffer full; dropped oldest pending payload"
            );
        }
    }
    tracing::debug!("head producer stopped");
}

async fn publish_loop<P: ChainPipeline>(
    worker_id: usize,
    pipeline: Arc<P>,
    buffer: Arc<LatestWinsBuffer<P::Payload>>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = buffer.pop() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let height = pipeline.payload_height(&payload);
        match pipeline.publish(payload).await {
            Ok(()) => {
                telemetry.record_published_block();
                tracing::debug!(worker = worker_id, height, "published head block");
            }
            Err(err) => {
                telemetry.record_publish_failure();
                tracing::error!(worker = worker_id, height, error = %err, "publish failed");
            }
        }
    }
    tracing::debug!(worker = worker_id, "publish worker stopped");
}
