//! Bitcoin Core JSON-RPC client and the `Fetcher`/`HeadSource` seams the
//! ingestion modes consume.

use crate::chain::types::RawBlock;
use crate::rpc::options::RpcClientOptions;
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bitcoin::{consensus, Block, BlockHash};
use futures::future::BoxFuture;
use jsonrpsee::core::{client::ClientT, params::BatchRequestBuilder};
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::types::ErrorObject;
use serde::de::DeserializeOwned;
use std::{fmt, future::Future, str::FromStr, sync::Arc};
use tokio::time::{sleep, timeout};

/// `RPC_INVALID_PARAMETER`, returned by `getblockhash` past the tip.
const RPC_INVALID_PARAMETER: i32 = -8;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc method {method} timed out")]
    Timeout { method: &'static str },
    #[error("requested height {height} is above the current tip")]
    HeightOutOfRange { height: u64 },
    #[error("rpc {method} failed (code={code}, message={message})")]
    Node {
        method: &'static str,
        code: i32,
        message: String,
    },
}

/// Batch fetch of full blocks by an arbitrary, possibly non-contiguous height list.
pub trait Fetcher: Send + Sync {
    fn fetch_at<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<RawBlock>>>;
}

/// Chain head queries used by the live streamer.
pub trait HeadSource: Send + Sync {
    /// Current best height and the hash at that height.
    fn head(&self) -> BoxFuture<'_, Result<(u64, BlockHash)>>;

    fn block(&self, hash: BlockHash) -> BoxFuture<'_, Result<Block>>;
}

#[derive(Debug, Clone)]
pub struct AsyncRpcClient {
    rpc_url: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
}

impl Fetcher for AsyncRpcClient {
    fn fetch_at<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<RawBlock>>> {
        Box::pin(self.blocks_at(heights))
    }
}

impl HeadSource for AsyncRpcClient {
    fn head(&self) -> BoxFuture<'_, Result<(u64, BlockHash)>> {
        Box::pin(async move {
            let height = self.get_block_count().await?;
            let hash = self.get_block_hash(height).await?;
            Ok((height, hash))
        })
    }

    fn block(&self, hash: BlockHash) -> BoxFuture<'_, Result<Block>> {
        Box::pin(async move { self.get_block(&hash).await })
    }
}

impl AsyncRpcClient {
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::with_options(url, user, password, RpcClientOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        options: RpcClientOptions,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let response_limit = u32::try_from(options.max_response_body_bytes).unwrap_or(u32::MAX);
        let client = HttpClientBuilder::default()
            .set_headers(build_auth_headers(&user.into(), &password.into())?)
            .request_timeout(options.request_timeout)
            .max_response_size(response_limit)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client for {rpc_url}: {err}"))?;

        Ok(Self {
            rpc_url: Arc::new(rpc_url),
            client,
            options,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    /// Fetches full blocks for `heights` in request order. Heights above the
    /// node tip are left out of the result instead of failing the batch.
    pub async fn blocks_at(&self, heights: &[u64]) -> Result<Vec<RawBlock>> {
        match self.batch_get_blocks(heights).await {
            Err(err) if is_beyond_tip(&err) => {
                let tip = self.get_block_count().await?;
                let servable: Vec<u64> = heights.iter().copied().filter(|h| *h <= tip).collect();
                tracing::debug!(
                    requested = heights.len(),
                    servable = servable.len(),
                    tip,
                    "batch trimmed to the current tip"
                );
                self.batch_get_blocks(&servable).await
            }
            result => result,
        }
    }

    /// Fetches full blocks for `heights` in request order. Fails as a whole if
    /// any height is above the tip.
    pub async fn batch_get_blocks(&self, heights: &[u64]) -> Result<Vec<RawBlock>> {
        if heights.is_empty() {
            return Ok(Vec::new());
        }

        let hexes = self
            .with_retry("getblock batch", || self.block_hexes(heights))
            .await?;
        let blocks = heights
            .iter()
            .zip(&hexes)
            .map(|(height, hex)| {
                hex_to_block(hex)
                    .map(|block| RawBlock::new(*height, block))
                    .with_context(|| format!("failed to decode block at height {height}"))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            lowest = heights.iter().min().copied().unwrap_or_default(),
            highest = heights.iter().max().copied().unwrap_or_default(),
            blocks = blocks.len(),
            "fetched block batch"
        );
        Ok(blocks)
    }

    pub async fn get_block_count(&self) -> Result<u64> {
        const METHOD: &str = "getblockcount";
        self.with_retry(METHOD, || self.call(METHOD, rpc_params![]))
            .await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<BlockHash> {
        const METHOD: &str = "getblockhash";
        let hash: String = self
            .with_retry(METHOD, || self.call(METHOD, rpc_params![height]))
            .await?;
        BlockHash::from_str(&hash)
            .with_context(|| format!("node returned an invalid hash for height {height}"))
    }

    pub async fn get_block(&self, hash: &BlockHash) -> Result<Block> {
        const METHOD: &str = "getblock";
        let hash = hash.to_string();
        let hex: String = self
            .with_retry(METHOD, || self.call(METHOD, rpc_params![hash.as_str(), 0u64]))
            .await?;
        hex_to_block(&hex).with_context(|| format!("failed to decode block {hash}"))
    }

    /// Retries `operation` with exponential backoff. Out-of-range heights are not retried.
    async fn with_retry<T, F, Fut>(&self, method: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if is_beyond_tip(&err) {
                tracing::debug!(method, error = %err, "height beyond tip; not retrying");
                return Err(err);
            }
            if attempt >= self.options.max_attempts {
                tracing::warn!(method, attempt, error = %err, "rpc call failed; retries exhausted");
                return Err(err);
            }

            let backoff = self.options.backoff_delay(attempt);
            tracing::debug!(
                method,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "rpc call failed; retrying"
            );
            sleep(backoff).await;
        }
    }

    /// Two batched round trips: every `getblockhash`, then every `getblock <hash> 0`.
    async fn block_hexes(&self, heights: &[u64]) -> Result<Vec<String>> {
        let mut hash_calls = BatchRequestBuilder::new();
        for height in heights {
            hash_calls
                .insert("getblockhash", rpc_params![height])
                .context("failed to encode getblockhash params")?;
        }
        let hashes: Vec<String> = self
            .send_batch("getblockhash", hash_calls, Some(heights))
            .await?;

        let mut block_calls = BatchRequestBuilder::new();
        for hash in &hashes {
            block_calls
                .insert("getblock", rpc_params![hash, 0u64])
                .context("failed to encode getblock params")?;
        }
        let hexes: Vec<String> = self.send_batch("getblock", block_calls, None).await?;

        if hexes.len() != heights.len() {
            bail!(
                "node answered {} of {} getblock calls",
                hexes.len(),
                heights.len()
            );
        }
        Ok(hexes)
    }

    async fn call<R>(
        &self,
        method: &'static str,
        params: jsonrpsee::core::params::ArrayParams,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(
            self.options.request_timeout,
            self.client.request(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| anyhow!("rpc {method} call failed: {err}"))
    }

    /// Sends one batch. `heights`, when given, lines up with the calls so an
    /// out-of-range answer can name its height.
    async fn send_batch<'a, R>(
        &self,
        method: &'static str,
        batch: BatchRequestBuilder<'a>,
        heights: Option<&[u64]>,
    ) -> Result<Vec<R>>
    where
        R: DeserializeOwned + fmt::Debug + 'static,
    {
        let response = timeout(
            self.options.request_timeout,
            self.client.batch_request(batch),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| anyhow!("rpc {method} batch failed: {err}"))?;

        let mut values = Vec::with_capacity(response.len());
        for (idx, entry) in response.into_iter().enumerate() {
            let err = match entry {
                Ok(value) => {
                    values.push(value);
                    continue;
                }
                Err(err) => err,
            };
            return Err(match heights.and_then(|heights| heights.get(idx)) {
                Some(height) if err.code() == RPC_INVALID_PARAMETER => {
                    RpcError::HeightOutOfRange { height: *height }.into()
                }
                _ => node_error(method, &err),
            });
        }

        tracing::trace!(method, count = values.len(), "batch RPC call completed");
        Ok(values)
    }
}

fn is_beyond_tip(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RpcError>(),
        Some(RpcError::HeightOutOfRange { .. })
    )
}

fn node_error(method: &'static str, err: &ErrorObject<'_>) -> anyhow::Error {
    RpcError::Node {
        method,
        code: err.code(),
        message: err.message().to_owned(),
    }
    .into()
}

/// Basic auth header; omitted entirely when both credentials are empty.
fn build_auth_headers(user: &str, password: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if !user.is_empty() || !password.is_empty() {
        let token = BASE64_STANDARD.encode(format!("{user}:{password}"));
        let value = HeaderValue::from_str(&format!("Basic {token}"))
            .context("credentials cannot be sent as an Authorization header")?;
        headers.insert("Authorization", value);
    }
    Ok(headers)
}

/// Decodes a hexadecimal string into a Bitcoin [`Block`].
pub fn hex_to_block(hex: &str) -> Result<Block> {
    let bytes = hex::decode(hex.trim()).context("block hex is not valid hexadecimal")?;
    consensus::deserialize::<Block>(&bytes).context("block bytes do not decode")
}
