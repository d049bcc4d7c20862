use crate::chain::converter::BitcoinConverter;
use crate::index::cleaner::IpldCleaner;
use crate::index::db::Database;
use crate::index::publisher::IpldPublisher;
use crate::index::retriever::GapRetriever;
use crate::processor::backfill::BackfillService;
use crate::processor::live::LiveSyncService;
use crate::processor::pipeline::BitcoinPipeline;
use crate::processor::resync::ResyncService;
use crate::rpc::options::RpcClientOptions;
use crate::rpc::AsyncRpcClient;
use crate::runtime::config::{IndexerConfig, ResyncConfig};
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Which ingestion loop the runner drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Follow the chain head.
    Sync,
    /// Periodically fill gaps until stopped.
    Backfill,
    /// Re-ingest the configured ranges once, then exit.
    Resync,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Sync => "sync",
            Mode::Backfill => "backfill",
            Mode::Resync => "resync",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" | "live" => Ok(Mode::Sync),
            "backfill" => Ok(Mode::Backfill),
            "resync" => Ok(Mode::Resync),
            other => bail!("unrecognized mode {other:?}; expected sync, backfill, or resync"),
        }
    }
}

/// Wires the store, node client, and services for one mode and handles OS
/// signals for graceful shutdowns.
pub struct Runner {
    config: IndexerConfig,
    resync: Option<ResyncConfig>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            resync: None,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Ranges used by [`Mode::Resync`].
    pub fn with_resync(mut self, resync: ResyncConfig) -> Self {
        self.resync = Some(resync);
        self
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Runs `mode` until a Ctrl-C (SIGINT) is received or the shutdown token is
    /// cancelled elsewhere. Resync returns on its own once its ranges are done.
    pub async fn run_until_ctrl_c(&mut self, mode: Mode) -> Result<()> {
        let db = self.open_store().await?;
        let reporter = spawn_metrics_reporter(
            self.telemetry.clone(),
            self.shutdown.child_token(),
            self.config.metrics_interval(),
        );
        tracing::info!(%mode, node_id = self.config.node_id(), "runner started");

        let result = match mode {
            Mode::Backfill => self.run_backfill(db).await,
            Mode::Sync => self.run_live(db).await,
            Mode::Resync => self.run_resync(db).await,
        };

        self.shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter failed to join");
        }
        self.shutdown = CancellationToken::new();
        result
    }

    async fn open_store(&self) -> Result<Database> {
        let path = self.config.database_path().to_path_buf();
        let options = self.config.database_options();
        let node_id = self.config.node_id().to_owned();
        tokio::task::spawn_blocking(move || Database::open(&path, options, node_id))
            .await
            .context("store open task did not complete")?
            .context("failed to open index store")
    }

    fn rpc_client(&self, options: RpcClientOptions) -> Result<Arc<AsyncRpcClient>> {
        let client = AsyncRpcClient::with_options(
            self.config.rpc_url(),
            self.config.rpc_user(),
            self.config.rpc_password(),
            options,
        )
        .context("failed to build node RPC client")?;
        Ok(Arc::new(client))
    }

    fn pipeline(&self, client: Arc<AsyncRpcClient>, db: &Database) -> Arc<BitcoinPipeline> {
        Arc::new(BitcoinPipeline::new(
            client,
            Arc::new(BitcoinConverter::new(self.config.network())),
            Arc::new(IpldPublisher::new(db.clone())),
        ))
    }

    async fn run_backfill(&self, db: Database) -> Result<()> {
        let client = self.rpc_client(self.config.rpc_options())?;
        let mut service = BackfillService::new(
            self.config.backfill_settings(),
            self.pipeline(client, &db),
            Arc::new(GapRetriever::new(db)),
            self.telemetry.clone(),
        );
        service.start()?;
        self.wait_for_shutdown().await;
        service.stop().await
    }

    async fn run_live(&self, db: Database) -> Result<()> {
        let client = self.rpc_client(self.config.rpc_options())?;
        let mut service = LiveSyncService::new(
            self.config.live_settings(),
            self.pipeline(client.clone(), &db),
            client,
            self.telemetry.clone(),
        );
        service.start()?;
        self.wait_for_shutdown().await;
        service.stop().await
    }

    async fn run_resync(&self, db: Database) -> Result<()> {
        let resync = self
            .resync
            .as_ref()
            .context("resync mode requires a resync configuration")?;
        let client = self.rpc_client(resync.rpc_options())?;
        let service = ResyncService::new(
            resync.settings(),
            self.pipeline(client, &db),
            Arc::new(IpldCleaner::new(db)),
            self.telemetry.clone(),
        );
        let cancel = service.cancellation_token();

        let run = service.run();
        tokio::pin!(run);
        let report = tokio::select! {
            report = &mut run => report?,
            _ = self.wait_for_shutdown() => {
                cancel.cancel();
                run.await?
            }
        };
        tracing::info!(
            published = report.published,
            failures = report.failures,
            "resync finished"
        );
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "failed to listen for Ctrl-C; shutting down");
                } else {
                    tracing::info!("Ctrl-C received; shutting down runner");
                }
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }
    }
}
