use crate::index::cleaner::DataScope;
use crate::index::db::{DatabaseOptions, DEFAULT_MAX_OPEN_CONNECTIONS};
use crate::index::gaps::Gap;
use crate::processor::backfill::BackfillSettings;
use crate::processor::live::LiveSettings;
use crate::processor::resync::ResyncSettings;
use crate::processor::ring_buffer::DEFAULT_LIVE_BUFFER_CAPACITY;
use crate::processor::streamer::DEFAULT_HEAD_POLL_INTERVAL;
use crate::rpc::options::RpcClientOptions;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use bitcoin::Network;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_BACKFILL_FREQUENCY_SECS: u64 = 30;
const DEFAULT_VALIDATION_LEVEL: u32 = 1;
const DEFAULT_LIVE_WORKERS: usize = 1;
/// Backfill batches are large; shorter HTTP timeouts are raised to this.
const MIN_BACKFILL_HTTP_TIMEOUT_SECS: u64 = 15;
const MIN_RESYNC_HTTP_TIMEOUT_SECS: u64 = 5;

pub const ENV_BTC_HTTP_PATH: &str = "BTC_HTTP_PATH";
pub const ENV_BTC_NODE_USER: &str = "BTC_NODE_USER";
pub const ENV_BTC_NODE_PASSWORD: &str = "BTC_NODE_PASSWORD";
pub const ENV_BTC_NODE_ID: &str = "BTC_NODE_ID";
pub const ENV_BTC_NETWORK: &str = "BTC_NETWORK";
pub const ENV_DATABASE_PATH: &str = "DATABASE_PATH";
pub const ENV_HTTP_TIMEOUT: &str = "HTTP_TIMEOUT";
pub const ENV_BACKFILL_FREQUENCY: &str = "BACKFILL_FREQUENCY";
pub const ENV_BACKFILL_BATCH_SIZE: &str = "BACKFILL_BATCH_SIZE";
pub const ENV_BACKFILL_WORKERS: &str = "BACKFILL_WORKERS";
pub const ENV_BACKFILL_VALIDATION_LEVEL: &str = "BACKFILL_VALIDATION_LEVEL";
pub const ENV_DATABASE_MAX_OPEN_CONNECTIONS: &str = "DATABASE_MAX_OPEN_CONNECTIONS";
pub const ENV_DATABASE_MAX_IDLE_CONNECTIONS: &str = "DATABASE_MAX_IDLE_CONNECTIONS";
pub const ENV_DATABASE_MAX_CONN_LIFETIME: &str = "DATABASE_MAX_CONN_LIFETIME";
pub const ENV_RESYNC_START: &str = "RESYNC_START";
pub const ENV_RESYNC_STOP: &str = "RESYNC_STOP";
pub const ENV_RESYNC_BATCH_SIZE: &str = "RESYNC_BATCH_SIZE";
pub const ENV_RESYNC_WORKERS: &str = "RESYNC_WORKERS";
pub const ENV_RESYNC_CLEAR_OLD_CACHE: &str = "RESYNC_CLEAR_OLD_CACHE";
pub const ENV_RESYNC_TYPE: &str = "RESYNC_TYPE";
pub const ENV_RESYNC_RESET_VALIDATION: &str = "RESYNC_RESET_VALIDATION";
pub const ENV_SYNC_WORKERS: &str = "SYNC_WORKERS";

/// Runtime configuration shared by the backfill and live modes.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or [`IndexerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
    node_id: String,
    network: Network,
    database_path: PathBuf,
    http_timeout: Duration,
    backfill_frequency: Duration,
    batch_size: usize,
    workers: usize,
    validation_level: u32,
    db_max_open: u32,
    db_max_idle: Option<u32>,
    db_max_lifetime: Option<Duration>,
    live_workers: usize,
    live_buffer_capacity: usize,
    head_poll_interval: Duration,
    metrics_interval: Duration,
}

pub struct IndexerConfigParams {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub node_id: String,
    pub network: Network,
    pub database_path: PathBuf,
    pub http_timeout: Duration,
    pub backfill_frequency: Duration,
    pub batch_size: usize,
    pub workers: usize,
    pub validation_level: u32,
    pub db_max_open: u32,
    pub db_max_idle: Option<u32>,
    pub db_max_lifetime: Option<Duration>,
    pub live_workers: usize,
    pub live_buffer_capacity: usize,
    pub head_poll_interval: Duration,
    pub metrics_interval: Duration,
}

impl IndexerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// The HTTP timeout is raised to the backfill minimum before validation.
    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            rpc_url,
            rpc_user,
            rpc_password,
            node_id,
            network,
            database_path,
            http_timeout,
            backfill_frequency,
            batch_size,
            workers,
            validation_level,
            db_max_open,
            db_max_idle,
            db_max_lifetime,
            live_workers,
            live_buffer_capacity,
            head_poll_interval,
            metrics_interval,
        } = params;

        let config = Self {
            rpc_url: trimmed_string(rpc_url),
            rpc_user: trimmed_string(rpc_user),
            rpc_password,
            node_id: trimmed_string(node_id),
            network,
            database_path,
            http_timeout: http_timeout.max(Duration::from_secs(MIN_BACKFILL_HTTP_TIMEOUT_SECS)),
            backfill_frequency,
            batch_size,
            workers,
            validation_level,
            db_max_open,
            db_max_idle,
            db_max_lifetime,
            live_workers,
            live_buffer_capacity,
            head_poll_interval,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration from any name → value source.
    ///
    /// Unset variables fall back to defaults; malformed ones are errors naming the variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut builder = IndexerConfig::builder();

        if let Some(url) = env.string(ENV_BTC_HTTP_PATH) {
            builder = builder.rpc_url(normalize_rpc_url(&url));
        }
        if let Some(user) = env.string(ENV_BTC_NODE_USER) {
            builder = builder.rpc_user(user);
        }
        if let Some(password) = env.string(ENV_BTC_NODE_PASSWORD) {
            builder = builder.rpc_password(password);
        }
        if let Some(node_id) = env.string(ENV_BTC_NODE_ID) {
            builder = builder.node_id(node_id);
        }
        if let Some(network) = env.string(ENV_BTC_NETWORK) {
            builder = builder.network(parse_network(&network).with_context(|| {
                format!("invalid value for {ENV_BTC_NETWORK}")
            })?);
        }
        if let Some(path) = env.string(ENV_DATABASE_PATH) {
            builder = builder.database_path(path);
        }
        if let Some(secs) = env.parse::<u64>(ENV_HTTP_TIMEOUT)? {
            builder = builder.http_timeout(Duration::from_secs(secs));
        }
        // Non-positive frequencies fall back to the default.
        if let Some(secs) = env.parse::<u64>(ENV_BACKFILL_FREQUENCY)? {
            if secs > 0 {
                builder = builder.backfill_frequency(Duration::from_secs(secs));
            }
        }
        if let Some(size) = env.parse(ENV_BACKFILL_BATCH_SIZE)? {
            builder = builder.batch_size(size);
        }
        if let Some(workers) = env.parse(ENV_BACKFILL_WORKERS)? {
            builder = builder.workers(workers);
        }
        if let Some(level) = env.parse(ENV_BACKFILL_VALIDATION_LEVEL)? {
            builder = builder.validation_level(level);
        }
        if let Some(max_open) = env.parse(ENV_DATABASE_MAX_OPEN_CONNECTIONS)? {
            builder = builder.db_max_open(max_open);
        }
        if let Some(max_idle) = env.parse(ENV_DATABASE_MAX_IDLE_CONNECTIONS)? {
            builder = builder.db_max_idle(max_idle);
        }
        if let Some(secs) = env.parse::<u64>(ENV_DATABASE_MAX_CONN_LIFETIME)? {
            if secs > 0 {
                builder = builder.db_max_lifetime(Duration::from_secs(secs));
            }
        }
        if let Some(workers) = env.parse(ENV_SYNC_WORKERS)? {
            builder = builder.live_workers(workers);
        }

        builder.build()
    }

    /// Full RPC URL (including scheme) of the node.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// RPC username; empty means no authentication header is sent.
    pub fn rpc_user(&self) -> &str {
        &self.rpc_user
    }

    /// RPC password.
    pub fn rpc_password(&self) -> &str {
        &self.rpc_password
    }

    /// Identifier stamped on every header row written by this process.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Network used to render output addresses.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Location of the SQLite index file.
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Per-request HTTP timeout, never below the backfill minimum.
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    /// Interval between backfill gap scans.
    pub fn backfill_frequency(&self) -> Duration {
        self.backfill_frequency
    }

    /// Maximum number of heights per bin.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of backfill workers per pass.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Minimum `times_validated` a height needs to be considered done.
    pub fn validation_level(&self) -> u32 {
        self.validation_level
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers
    }

    pub fn live_buffer_capacity(&self) -> usize {
        self.live_buffer_capacity
    }

    pub fn head_poll_interval(&self) -> Duration {
        self.head_poll_interval
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_open: self.db_max_open,
            min_idle: self.db_max_idle,
            max_lifetime: self.db_max_lifetime,
            ..DatabaseOptions::default()
        }
    }

    pub fn rpc_options(&self) -> RpcClientOptions {
        RpcClientOptions {
            request_timeout: self.http_timeout,
            ..RpcClientOptions::default()
        }
    }

    pub fn backfill_settings(&self) -> BackfillSettings {
        BackfillSettings {
            batch_size: self.batch_size,
            workers: self.workers,
            frequency: self.backfill_frequency,
            validation_level: self.validation_level,
        }
    }

    pub fn live_settings(&self) -> LiveSettings {
        LiveSettings {
            workers: self.live_workers,
            buffer_capacity: self.live_buffer_capacity,
            poll_interval: self.head_poll_interval,
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;
        ensure_not_empty(&self.node_id, "node_id")?;
        if self.database_path.as_os_str().is_empty() {
            bail!("database_path cannot be empty");
        }

        if self.backfill_frequency.is_zero() {
            bail!("backfill_frequency must be greater than 0");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }

        if self.db_max_open == 0 {
            bail!("db_max_open must be greater than 0");
        }

        if let Some(max_idle) = self.db_max_idle {
            if max_idle > self.db_max_open {
                bail!("db_max_idle must not exceed db_max_open");
            }
        }

        if self.live_workers == 0 {
            bail!("live_workers must be greater than 0");
        }

        if self.live_buffer_capacity == 0 {
            bail!("live_buffer_capacity must be greater than 0");
        }

        if self.head_poll_interval.is_zero() {
            bail!("head_poll_interval must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    rpc_url: Option<String>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    node_id: Option<String>,
    network: Option<Network>,
    database_path: Option<PathBuf>,
    http_timeout: Option<Duration>,
    backfill_frequency: Option<Duration>,
    batch_size: Option<usize>,
    workers: Option<usize>,
    validation_level: Option<u32>,
    db_max_open: Option<u32>,
    db_max_idle: Option<u32>,
    db_max_lifetime: Option<Duration>,
    live_workers: Option<usize>,
    live_buffer_capacity: Option<usize>,
    head_poll_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl IndexerConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn rpc_user(mut self, user: impl Into<String>) -> Self {
        self.rpc_user = Some(user.into());
        self
    }

    pub fn rpc_password(mut self, password: impl Into<String>) -> Self {
        self.rpc_password = Some(password.into());
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    pub fn backfill_frequency(mut self, frequency: Duration) -> Self {
        self.backfill_frequency = Some(frequency);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn validation_level(mut self, level: u32) -> Self {
        self.validation_level = Some(level);
        self
    }

    pub fn db_max_open(mut self, max_open: u32) -> Self {
        self.db_max_open = Some(max_open);
        self
    }

    pub fn db_max_idle(mut self, max_idle: u32) -> Self {
        self.db_max_idle = Some(max_idle);
        self
    }

    pub fn db_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.db_max_lifetime = Some(lifetime);
        self
    }

    pub fn live_workers(mut self, workers: usize) -> Self {
        self.live_workers = Some(workers);
        self
    }

    pub fn live_buffer_capacity(mut self, capacity: usize) -> Self {
        self.live_buffer_capacity = Some(capacity);
        self
    }

    pub fn head_poll_interval(mut self, interval: Duration) -> Self {
        self.head_poll_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            rpc_user: self.rpc_user.unwrap_or_default(),
            rpc_password: self.rpc_password.unwrap_or_default(),
            node_id: self.node_id.context("node_id is required")?,
            network: self.network.unwrap_or(Network::Bitcoin),
            database_path: self.database_path.context("database_path is required")?,
            http_timeout: self
                .http_timeout
                .unwrap_or_else(|| Duration::from_secs(MIN_BACKFILL_HTTP_TIMEOUT_SECS)),
            backfill_frequency: self
                .backfill_frequency
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_BACKFILL_FREQUENCY_SECS)),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            workers: self.workers.unwrap_or(DEFAULT_WORKERS),
            validation_level: self.validation_level.unwrap_or(DEFAULT_VALIDATION_LEVEL),
            db_max_open: self.db_max_open.unwrap_or(DEFAULT_MAX_OPEN_CONNECTIONS),
            db_max_idle: self.db_max_idle,
            db_max_lifetime: self.db_max_lifetime,
            live_workers: self.live_workers.unwrap_or(DEFAULT_LIVE_WORKERS),
            live_buffer_capacity: self
                .live_buffer_capacity
                .unwrap_or(DEFAULT_LIVE_BUFFER_CAPACITY),
            head_poll_interval: self.head_poll_interval.unwrap_or(DEFAULT_HEAD_POLL_INTERVAL),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        IndexerConfig::new(params)
    }
}

/// Ranges and switches of one operator-triggered resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncConfig {
    ranges: Vec<Gap>,
    batch_size: usize,
    workers: usize,
    clear_old_cache: bool,
    reset_validation: bool,
    scope: DataScope,
    http_timeout: Duration,
}

pub struct ResyncConfigParams {
    pub ranges: Vec<Gap>,
    pub batch_size: usize,
    pub workers: usize,
    pub clear_old_cache: bool,
    pub reset_validation: bool,
    pub scope: DataScope,
    pub http_timeout: Duration,
}

impl ResyncConfig {
    /// The HTTP timeout is raised to the resync minimum before validation.
    pub fn new(params: ResyncConfigParams) -> Result<Self> {
        let config = Self {
            ranges: params.ranges,
            batch_size: params.batch_size,
            workers: params.workers,
            clear_old_cache: params.clear_old_cache,
            reset_validation: params.reset_validation,
            scope: params.scope,
            http_timeout: params
                .http_timeout
                .max(Duration::from_secs(MIN_RESYNC_HTTP_TIMEOUT_SECS)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the single `RESYNC_START..=RESYNC_STOP` range and its switches
    /// from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let start = env
            .parse::<u64>(ENV_RESYNC_START)?
            .with_context(|| format!("{ENV_RESYNC_START} is required"))?;
        let stop = env
            .parse::<u64>(ENV_RESYNC_STOP)?
            .with_context(|| format!("{ENV_RESYNC_STOP} is required"))?;
        let scope = match env.string(ENV_RESYNC_TYPE) {
            Some(value) => value
                .parse::<DataScope>()
                .with_context(|| format!("invalid value for {ENV_RESYNC_TYPE}"))?,
            None => DataScope::default(),
        };

        Self::new(ResyncConfigParams {
            ranges: vec![Gap::new(start, stop)],
            batch_size: env.parse(ENV_RESYNC_BATCH_SIZE)?.unwrap_or(DEFAULT_BATCH_SIZE),
            workers: env.parse(ENV_RESYNC_WORKERS)?.unwrap_or(DEFAULT_WORKERS),
            clear_old_cache: env.flag(ENV_RESYNC_CLEAR_OLD_CACHE)?.unwrap_or(false),
            reset_validation: env.flag(ENV_RESYNC_RESET_VALIDATION)?.unwrap_or(false),
            scope,
            http_timeout: env
                .parse::<u64>(ENV_HTTP_TIMEOUT)?
                .map(Duration::from_secs)
                .unwrap_or_default(),
        })
    }

    pub fn ranges(&self) -> &[Gap] {
        &self.ranges
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn clear_old_cache(&self) -> bool {
        self.clear_old_cache
    }

    pub fn reset_validation(&self) -> bool {
        self.reset_validation
    }

    pub fn scope(&self) -> DataScope {
        self.scope
    }

    /// Per-request HTTP timeout, never below the resync minimum.
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub fn rpc_options(&self) -> RpcClientOptions {
        RpcClientOptions {
            request_timeout: self.http_timeout,
            ..RpcClientOptions::default()
        }
    }

    pub fn settings(&self) -> ResyncSettings {
        ResyncSettings {
            ranges: self.ranges.clone(),
            batch_size: self.batch_size,
            workers: self.workers,
            clear_old_cache: self.clear_old_cache,
            reset_validation: self.reset_validation,
            scope: self.scope,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ranges.is_empty() {
            bail!("ranges cannot be empty");
        }
        for range in &self.ranges {
            if range.stop < range.start {
                bail!(
                    "ranges must not end before they start (got {} to {})",
                    range.start,
                    range.stop
                );
            }
        }

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }

        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|err| anyhow::anyhow!("invalid value for {name} ({value:?}): {err}"))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<Option<bool>> {
        self.string(name)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("invalid value for {name} ({value:?}): expected a boolean"),
            })
            .transpose()
    }
}

fn parse_network(value: &str) -> Result<Network> {
    match value.to_ascii_lowercase().as_str() {
        "main" | "mainnet" => Ok(Network::Bitcoin),
        "test" => Ok(Network::Testnet),
        other => Network::from_str(other)
            .map_err(|err| anyhow::anyhow!("unknown network {other:?}: {err}")),
    }
}

/// Accepts bare `host:port` paths, as nodes are often configured that way.
fn normalize_rpc_url(value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        value.to_owned()
    } else {
        format!("http://{value}")
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
