//! Bitcoin payload model and the converter that derives indexable rows from
//! fetched blocks.

pub mod converter;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod types;

pub use converter::{BitcoinConverter, Converter};
pub use types::{ConvertedPayload, RawBlock, ScriptClass, TxInput, TxModel, TxOutput};
