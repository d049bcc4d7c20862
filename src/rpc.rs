//! JSON-RPC plumbing for Bitcoin Core: batched block fetches, head queries,
//! and the retry policy wrapped around them.

pub mod client;
pub mod options;

pub use client::{hex_to_block, AsyncRpcClient, Fetcher, HeadSource, RpcError};
pub use options::RpcClientOptions;
