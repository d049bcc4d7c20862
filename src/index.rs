//! Relational index and content store: schema, transactional publisher, gap
//! retriever, and range cleaner.

pub mod cleaner;
pub mod db;
pub mod error;
pub mod gaps;
pub mod ipld;
pub mod publisher;
pub mod retriever;
pub mod tx_guard;

pub use cleaner::{Cleaner, DataScope, IpldCleaner};
pub use db::{Database, DatabaseOptions};
pub use error::{IndexError, IndexResult};
pub use gaps::{compress_to_gaps, gaps_to_bins, height_bins, Gap};
pub use publisher::{IpldPublisher, Publisher};
pub use retriever::{GapRetriever, HeaderValidation, Retriever};
