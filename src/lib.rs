pub mod chain;
pub mod index;
pub mod processor;
pub mod rpc;
pub mod runtime;

pub use chain::{BitcoinConverter, ConvertedPayload, Converter, RawBlock};
pub use index::{
    compress_to_gaps, Cleaner, DataScope, Database, DatabaseOptions, Gap, GapRetriever,
    IndexError, IndexResult, IpldCleaner, IpldPublisher, Publisher, Retriever,
};
pub use processor::{
    BackfillService, BinWorkerPool, BitcoinPipeline, ChainPipeline, LatestWinsBuffer,
    LiveSyncService, PoolReport, ResyncService,
};
pub use rpc::{AsyncRpcClient, Fetcher, HeadSource, RpcError};
pub use runtime::config::{
    IndexerConfig, IndexerConfigBuilder, IndexerConfigParams, ResyncConfig, ResyncConfigParams,
};
pub use runtime::runner::{Mode, Runner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
