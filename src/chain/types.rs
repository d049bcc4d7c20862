use bitcoin::{Block, BlockHash};
use std::fmt;

/// A block as returned by the node, tagged with the height it was fetched at.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    pub height: u64,
    pub block: Block,
}

impl RawBlock {
    pub fn new(height: u64, block: Block) -> Self {
        Self { height, block }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.block.block_hash()
    }
}

/// Structured rows derived from one block, ready for the publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedPayload {
    pub height: u64,
    pub block: Block,
    pub transactions: Vec<TxModel>,
}

impl ConvertedPayload {
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn block_hash(&self) -> BlockHash {
        self.block.block_hash()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxModel {
    pub tx_hash: String,
    pub index: i64,
    pub segwit: bool,
    pub witness_hash: Option<String>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub index: i64,
    /// Witness stack items, hex encoded.
    pub witness: Vec<String>,
    pub signature_script: Vec<u8>,
    pub outpoint_hash: String,
    pub outpoint_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub index: i64,
    /// Value in satoshis.
    pub value: i64,
    pub pk_script: Vec<u8>,
    pub script_class: ScriptClass,
    pub addresses: Vec<String>,
    pub required_sigs: i64,
}

/// Standard output script templates, numbered as stored in `tx_outputs.script_class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScriptClass {
    NonStandard = 0,
    PubKey = 1,
    PubKeyHash = 2,
    WitnessV0PubKeyHash = 3,
    ScriptHash = 4,
    WitnessV0ScriptHash = 5,
    MultiSig = 6,
    NullData = 7,
    WitnessUnknown = 8,
    WitnessV1Taproot = 9,
}

impl ScriptClass {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ScriptClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScriptClass::NonStandard => "nonstandard",
            ScriptClass::PubKey => "pubkey",
            ScriptClass::PubKeyHash => "pubkeyhash",
            ScriptClass::WitnessV0PubKeyHash => "witness_v0_keyhash",
            ScriptClass::ScriptHash => "scripthash",
            ScriptClass::WitnessV0ScriptHash => "witness_v0_scripthash",
            ScriptClass::MultiSig => "multisig",
            ScriptClass::NullData => "nulldata",
            ScriptClass::WitnessUnknown => "witness_unknown",
            ScriptClass::WitnessV1Taproot => "witness_v1_taproot",
        };
        f.write_str(label)
    }
}
