use anyhow::{Context, Result};
use protoindex::{init_tracing, IndexerConfig, Mode, ResyncConfig, Runner};

const ENV_MODE: &str = "PROTOINDEX_MODE";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mode = match std::env::var(ENV_MODE) {
        Ok(value) => value
            .parse::<Mode>()
            .with_context(|| format!("invalid value for {ENV_MODE}"))?,
        Err(_) => Mode::Sync,
    };
    let config = IndexerConfig::from_env().context("failed to load indexer configuration")?;

    let mut runner = Runner::new(config);
    if mode == Mode::Resync {
        let resync = ResyncConfig::from_env().context("failed to load resync configuration")?;
        runner = runner.with_resync(resync);
    }

    runner.run_until_ctrl_c(mode).await
}
