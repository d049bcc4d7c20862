//! Closed worker-pool lifecycle shared by backfill and resync passes.
//!
//! A pass starts `n` workers, submits every bin onto one unbounded work
//! channel, then calls [`BinWorkerPool::drain_and_stop`]. Draining sends one
//! shutdown token per worker on a separate signal channel. Workers only look
//! at either channel between bins, so a token is never taken by a worker that
//! is halfway through one, and the pass is over only once every worker task
//! has been joined.

use crate::processor::pipeline::{process_bin, ChainPipeline};
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Result};
use futures::FutureExt;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Totals for one pool pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub bins: usize,
    pub heights: usize,
    pub published: usize,
    pub failures: usize,
    pub panicked_workers: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    bins: AtomicUsize,
    heights: AtomicUsize,
    published: AtomicUsize,
    failures: AtomicUsize,
}

/// Both receivers sit behind one lock so a worker races them atomically.
struct Inbox {
    work: mpsc::UnboundedReceiver<Vec<u64>>,
    signal: mpsc::Receiver<()>,
}

enum Next {
    Bin(Vec<u64>),
    Stop,
}

impl Inbox {
    /// Pending work wins over a shutdown token, which in turn is only
    /// consulted once the work channel is momentarily empty.
    async fn next(&mut self, cancel: &CancellationToken) -> Next {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Next::Stop,
            bin = self.work.recv() => bin.map_or(Next::Stop, Next::Bin),
            _ = self.signal.recv() => Next::Stop,
        }
    }
}

pub struct BinWorkerPool<P: ChainPipeline> {
    pipeline: Arc<P>,
    telemetry: Arc<Telemetry>,
    cancel: CancellationToken,
    counters: Arc<PoolCounters>,
    work_tx: Option<mpsc::UnboundedSender<Vec<u64>>>,
    signal_tx: Option<mpsc::Sender<()>>,
    workers_done: Option<watch::Receiver<bool>>,
    workers: Vec<JoinHandle<bool>>,
}

impl<P: ChainPipeline> BinWorkerPool<P> {
    /// `cancel` aborts the pass between bins; bins still queued are dropped.
    pub fn new(pipeline: Arc<P>, telemetry: Arc<Telemetry>, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            telemetry,
            cancel,
            counters: Arc::new(PoolCounters::default()),
            work_tx: None,
            signal_tx: None,
            workers_done: None,
            workers: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.work_tx.is_some()
    }

    /// Spawns `workers` tasks (at least one) sharing the work channel.
    pub fn start(&mut self, workers: usize) -> Result<()> {
        if self.is_running() {
            bail!("worker pool is already running");
        }

        let workers = workers.max(1);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let inbox = Arc::new(Mutex::new(Inbox {
            work: work_rx,
            signal: signal_rx,
        }));
        let remaining = Arc::new(AtomicUsize::new(workers));
        let done_tx = Arc::new(done_tx);

        for worker_id in 0..workers {
            let inbox = inbox.clone();
            let pipeline = self.pipeline.clone();
            let telemetry = self.telemetry.clone();
            let counters = self.counters.clone();
            let cancel = self.cancel.clone();
            let remaining = remaining.clone();
            let done_tx = done_tx.clone();

            let handle = tokio::spawn(async move {
                let run = run_worker(worker_id, inbox, pipeline, telemetry, counters, cancel);
                let result = std::panic::AssertUnwindSafe(run).catch_unwind().await;

                let panicked = match result {
                    Ok(()) => false,
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(
                            worker = worker_id,
                            panic = %panic_msg,
                            "worker task panicked"
                        );
                        true
                    }
                };

                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = done_tx.send(true);
                }
                panicked
            });
            self.workers.push(handle);
        }

        self.work_tx = Some(work_tx);
        self.signal_tx = Some(signal_tx);
        self.workers_done = Some(done_rx);
        tracing::debug!(workers, "worker pool started");
        Ok(())
    }

    /// Queues one bin. Never blocks.
    pub fn submit(&self, bin: Vec<u64>) -> Result<()> {
        let Some(work_tx) = self.work_tx.as_ref() else {
            bail!("worker pool is not running");
        };
        if work_tx.send(bin).is_err() {
            bail!("every worker has exited; bin was not queued");
        }
        Ok(())
    }

    /// Sends one shutdown token per worker and joins them all.
    ///
    /// Workers drain queued bins before they accept a token, so on return
    /// every submitted bin has been processed unless the pool was cancelled.
    /// The signal channel buffers one token, so a send may complete before a
    /// worker is free to take it. Each worker takes exactly one token and
    /// exits, and the final join waits for all of them, so the buffered token
    /// never lets this return while a bin is still in flight.
    pub async fn drain_and_stop(&mut self) -> PoolReport {
        let (Some(work_tx), Some(signal_tx), Some(mut done_rx)) = (
            self.work_tx.take(),
            self.signal_tx.take(),
            self.workers_done.take(),
        ) else {
            return PoolReport::default();
        };

        for _ in 0..self.workers.len() {
            tokio::select! {
                sent = signal_tx.send(()) => {
                    if sent.is_err() {
                        break;
                    }
                }
                // Panicked or cancelled workers will never take their token.
                _ = done_rx.wait_for(|done| *done).map(|_| ()) => break,
            }
        }
        drop(signal_tx);
        drop(work_tx);

        let mut panicked_workers = 0;
        for handle in self.workers.drain(..) {
            match handle.await {
                Ok(false) => {}
                Ok(true) => panicked_workers += 1,
                Err(err) => {
                    tracing::error!(error = %err, "worker task failed to join");
                    panicked_workers += 1;
                }
            }
        }

        let report = PoolReport {
            bins: self.counters.bins.swap(0, Ordering::SeqCst),
            heights: self.counters.heights.swap(0, Ordering::SeqCst),
            published: self.counters.published.swap(0, Ordering::SeqCst),
            failures: self.counters.failures.swap(0, Ordering::SeqCst),
            panicked_workers,
        };
        tracing::debug!(
            bins = report.bins,
            heights = report.heights,
            failures = report.failures,
            "worker pool drained"
        );
        report
    }
}

async fn run_worker<P: ChainPipeline>(
    worker_id: usize,
    inbox: Arc<Mutex<Inbox>>,
    pipeline: Arc<P>,
    telemetry: Arc<Telemetry>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut inbox = inbox.lock().await;
            inbox.next(&cancel).await
        };

        let bin = match next {
            Next::Bin(bin) => bin,
            Next::Stop => {
                tracing::debug!(worker = worker_id, "worker stopping between bins");
                return;
            }
        };

        let outcome = process_bin(pipeline.as_ref(), &telemetry, worker_id, &bin).await;
        counters.bins.fetch_add(1, Ordering::SeqCst);
        counters.heights.fetch_add(outcome.heights, Ordering::SeqCst);
        counters.published.fetch_add(outcome.published, Ordering::SeqCst);
        counters.failures.fetch_add(outcome.failures, Ordering::SeqCst);
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
