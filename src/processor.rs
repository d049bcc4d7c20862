//! Ingestion orchestration: the chain pipeline seam, the bin worker pool, and
//! the backfill, resync, and live sync services built on them.

pub mod backfill;
pub mod live;
pub mod pipeline;
pub mod resync;
pub mod ring_buffer;
pub mod streamer;
pub mod worker_pool;

pub use backfill::{BackfillService, BackfillSettings};
pub use live::{LiveSettings, LiveSyncService};
pub use pipeline::{process_bin, BinOutcome, BitcoinPipeline, ChainPipeline};
pub use resync::{ResyncService, ResyncSettings};
pub use ring_buffer::{LatestWinsBuffer, DEFAULT_LIVE_BUFFER_CAPACITY};
pub use streamer::{HeadStreamer, DEFAULT_HEAD_POLL_INTERVAL};
pub use worker_pool::{BinWorkerPool, PoolReport};
