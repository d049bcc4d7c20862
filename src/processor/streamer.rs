//! Head-following block source for live sync.

use crate::chain::types::RawBlock;
use crate::rpc::HeadSource;
use anyhow::{Context, Result};
use bitcoin::BlockHash;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HEAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls the node tip and yields each new head block once.
///
/// Only the tip is followed: if several blocks are mined between two polls,
/// the intermediate ones are left for backfill to discover.
pub struct HeadStreamer {
    source: Arc<dyn HeadSource>,
    poll_interval: Duration,
    last_hash: Option<BlockHash>,
}

impl HeadStreamer {
    pub fn new(source: Arc<dyn HeadSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
            last_hash: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn last_hash(&self) -> Option<BlockHash> {
        self.last_hash
    }

    /// One poll: `Some` when the tip moved since the previous successful poll.
    pub async fn poll_once(&mut self) -> Result<Option<RawBlock>> {
        let (height, hash) = self.source.head().await.context("failed to read chain tip")?;
        if self.last_hash == Some(hash) {
            return Ok(None);
        }

        let block = self
            .source
            .block(hash)
            .await
            .with_context(|| format!("failed to fetch head block {hash} at height {height}"))?;
        self.last_hash = Some(hash);
        tracing::debug!(height, %hash, "new chain head");
        Ok(Some(RawBlock::new(height, block)))
    }
}
