use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{Context, Result};
use bitcoin::absolute::LockTime;
use bitcoin::blockdata::block::{Header as BlockHeader, Version};
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    consensus, Amount, Block, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction,
    TxMerkleNode, TxIn, TxOut, Witness,
};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A linear chain served by [`MockRpcServer`]. Heights above the tip limit
/// behave as if the node had not seen them yet.
#[derive(Clone)]
pub struct MockChain {
    inner: Arc<RwLock<MockChainInner>>,
    tip_limit: Arc<AtomicU64>,
    batch_calls: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct BlockData {
    height: u64,
    hash: String,
    hex: String,
}

struct MockChainInner {
    by_height: HashMap<u64, BlockData>,
    by_hash: HashMap<String, BlockData>,
}

impl MockChain {
    /// Builds `length` blocks (at least one); the whole chain is visible.
    pub fn new(length: u64) -> Self {
        let length = length.max(1);
        let mut by_height = HashMap::new();
        let mut by_hash = HashMap::new();
        let mut previous = BlockHash::all_zeros();

        for height in 0..length {
            let block = build_block(height, previous);
            let hash = block.block_hash();
            let data = BlockData {
                height,
                hash: hash.to_string(),
                hex: hex::encode(consensus::serialize(&block)),
            };
            by_hash.insert(data.hash.clone(), data.clone());
            by_height.insert(height, data);
            previous = hash;
        }

        Self {
            inner: Arc::new(RwLock::new(MockChainInner { by_height, by_hash })),
            tip_limit: Arc::new(AtomicU64::new(length - 1)),
            batch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn best_height(&self) -> u64 {
        self.tip_limit.load(Ordering::SeqCst)
    }

    pub fn hash_at(&self, height: u64) -> Option<String> {
        let inner = self.inner.read().expect("mock chain poisoned");
        inner.by_height.get(&height).map(|data| data.hash.clone())
    }

    /// Number of JSON-RPC batch requests served so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn visible_hash(&self, height: u64) -> Option<String> {
        if height > self.tip_limit.load(Ordering::SeqCst) {
            return None;
        }
        self.hash_at(height)
    }

    fn hex_for_hash(&self, hash: &str) -> Option<String> {
        let limit = self.tip_limit.load(Ordering::SeqCst);
        let inner = self.inner.read().expect("mock chain poisoned");
        inner.by_hash.get(hash).and_then(|data| {
            if data.height > limit {
                None
            } else {
                Some(data.hex.clone())
            }
        })
    }

    pub fn max_height(&self) -> u64 {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .by_height
            .keys()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn set_tip_limit(&self, limit: u64) {
        let clamped = limit.min(self.max_height());
        self.tip_limit.store(clamped, Ordering::SeqCst);
    }

    pub fn advance_tip_by(&self, delta: u64) -> u64 {
        let max_height = self.max_height();
        loop {
            let current = self.tip_limit.load(Ordering::SeqCst);
            let next = current.saturating_add(delta).min(max_height);
            if next == current {
                return current;
            }
            if self
                .tip_limit
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

/// One coinbase paying a height-specific P2PKH script, so every block and
/// every txid is distinct.
fn build_block(height: u64, prev_hash: BlockHash) -> Block {
    let mut script_sig = vec![0x08];
    script_sig.extend_from_slice(&height.to_le_bytes());
    let mut pk_script = vec![0x76, 0xa9, 0x14];
    pk_script.extend_from_slice(&[height as u8; 20]);
    pk_script.extend_from_slice(&[0x88, 0xac]);

    let coinbase = Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50 * 100_000_000),
            script_pubkey: ScriptBuf::from_bytes(pk_script),
        }],
    };

    let mut block = Block {
        header: BlockHeader {
            version: Version::from_consensus(1),
            prev_blockhash: prev_hash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_296_688_602 + height as u32 * 600,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: height as u32,
        },
        txdata: vec![coinbase],
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

/// Minimal Bitcoin Core JSON-RPC endpoint over [`MockChain`]: `getblockcount`,
/// `getblockhash`, and `getblock <hash> 0`, single or batched.
pub struct MockRpcServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockRpcServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock node listener")?;
        let addr = listener.local_addr().context("mock node has no local address")?;
        let listener = listener
            .into_std()
            .context("failed to hand the listener to hyper")?;
        listener
            .set_nonblocking(true)
            .context("failed to make the mock listener non-blocking")?;

        let make_service = make_service_fn(move |_| {
            let chain = chain.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| answer(chain.clone(), req))) }
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = Server::from_tcp(listener)
            .context("failed to build mock node server")?
            .serve(make_service)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("mock node stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{addr}"),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            // hyper 0.14 graceful shutdown can wait forever on a client
            // connection that was opened but never sent a request; bound it.
            if tokio::time::timeout(std::time::Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

fn plain(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

async fn answer(chain: MockChain, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "POST only".to_owned()));
    }
    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => return Ok(plain(StatusCode::BAD_REQUEST, format!("unreadable body: {err}"))),
    };
    let request: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => return Ok(plain(StatusCode::BAD_REQUEST, format!("not JSON: {err}"))),
    };

    let reply = match request {
        Value::Array(calls) => {
            chain.batch_calls.fetch_add(1, Ordering::SeqCst);
            Value::Array(calls.into_iter().map(|call| dispatch(&chain, &call)).collect())
        }
        call => dispatch(&chain, &call),
    };

    let mut response = Response::new(Body::from(reply.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn dispatch(chain: &MockChain, call: &Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let first_param = call
        .get("params")
        .and_then(Value::as_array)
        .and_then(|params| params.first());

    let result = match call.get("method").and_then(Value::as_str) {
        Some("getblockcount") => Ok(json!(chain.best_height())),
        Some("getblockhash") => first_param
            .and_then(Value::as_u64)
            .and_then(|height| chain.visible_hash(height))
            .map(Value::String)
            .ok_or((-8, "Block height out of range".to_owned())),
        Some("getblock") => first_param
            .and_then(Value::as_str)
            .and_then(|hash| chain.hex_for_hash(hash))
            .map(Value::String)
            .ok_or((-5, "Block not found".to_owned())),
        other => Err((-32601, format!("Method not found: {other:?}"))),
    };

    match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": id,
        }),
    }
}
