use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Process-wide ingestion counters shared by every mode.
#[derive(Default, Debug)]
pub struct Telemetry {
    published_blocks: AtomicU64,
    publish_failures: AtomicU64,
    fetch_failures: AtomicU64,
    convert_failures: AtomicU64,
    gaps_found: AtomicU64,
    evicted_payloads: AtomicU64,
}

impl Telemetry {
    pub fn record_published_block(&self) {
        self.published_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` heights were requested but never came back from the node.
    pub fn record_fetch_failures(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.fetch_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_convert_failure(&self) {
        self.convert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gaps_found(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.gaps_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evicted_payload(&self) {
        self.evicted_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            published_blocks: self.published_blocks.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            convert_failures: self.convert_failures.load(Ordering::Relaxed),
            gaps_found: self.gaps_found.load(Ordering::Relaxed),
            evicted_payloads: self.evicted_payloads.load(Ordering::Relaxed),
        }
    }

    pub fn published_blocks(&self) -> u64 {
        self.published_blocks.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    pub fn evicted_payloads(&self) -> u64 {
        self.evicted_payloads.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub published_blocks: u64,
    pub publish_failures: u64,
    pub fetch_failures: u64,
    pub convert_failures: u64,
    pub gaps_found: u64,
    pub evicted_payloads: u64,
}

/// Spawns a background task that periodically logs publish throughput and failure counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "protoindex::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let published_delta = current
                        .published_blocks
                        .saturating_sub(last_snapshot.published_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        published_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "protoindex::metrics",
                        throughput = format!("{throughput:.2}"),
                        published = current.published_blocks,
                        publish_failures = current.publish_failures,
                        fetch_failures = current.fetch_failures,
                        convert_failures = current.convert_failures,
                        gaps_found = current.gaps_found,
                        evicted_payloads = current.evicted_payloads,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
