//! Content addressing for block headers, transactions, and transaction merkle nodes.
//!
//! Every node is keyed by the double SHA-256 of its bytes wrapped as a multihash, so
//! identical bytes always map to the same storage key.

use crate::index::error::{IndexError, IndexResult};
use bitcoin::consensus;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::Block;
use multihash::Multihash;

pub const BITCOIN_HEADER_CODEC: u64 = 0xb0;
pub const BITCOIN_TX_CODEC: u64 = 0xb1;
pub const DBL_SHA2_256: u64 = 0x56;

const CID_VERSION: u64 = 1;
const BASE16_MULTIBASE_PREFIX: char = 'f';
const BLOCKSTORE_PREFIX: &str = "/blocks/";

/// A content-addressed blob together with its identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpldNode {
    pub cid: String,
    pub mh_key: String,
    pub raw: Vec<u8>,
}

impl IpldNode {
    pub fn new(codec: u64, raw: Vec<u8>) -> IndexResult<Self> {
        let digest = sha256d::Hash::hash(&raw).to_byte_array();
        let multihash = Multihash::<64>::wrap(DBL_SHA2_256, &digest)
            .map_err(|err| IndexError::ContentAddress(err.to_string()))?;
        let multihash_bytes = multihash.to_bytes();

        let mut cid_bytes = Vec::with_capacity(multihash_bytes.len() + 4);
        write_uvarint(&mut cid_bytes, CID_VERSION);
        write_uvarint(&mut cid_bytes, codec);
        cid_bytes.extend_from_slice(&multihash_bytes);

        Ok(Self {
            cid: format!("{BASE16_MULTIBASE_PREFIX}{}", hex::encode(cid_bytes)),
            mh_key: multihash_key(&multihash_bytes),
            raw,
        })
    }
}

/// Storage key derived from the multihash component of a CID.
pub fn multihash_key(multihash_bytes: &[u8]) -> String {
    format!("{BLOCKSTORE_PREFIX}{}", hex::encode_upper(multihash_bytes))
}

fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// All content-addressed nodes derived from one block.
#[derive(Debug, Clone)]
pub struct BlockNodes {
    pub header: IpldNode,
    pub transactions: Vec<IpldNode>,
    pub tx_trie: Vec<IpldNode>,
}

/// Builds the header node, one node per transaction, and the interior merkle nodes.
pub fn nodes_for_block(block: &Block) -> IndexResult<BlockNodes> {
    let header = IpldNode::new(BITCOIN_HEADER_CODEC, consensus::serialize(&block.header))?;
    let transactions = block
        .txdata
        .iter()
        .map(|tx| IpldNode::new(BITCOIN_TX_CODEC, consensus::serialize(tx)))
        .collect::<IndexResult<Vec<_>>>()?;

    let leaves = block
        .txdata
        .iter()
        .map(|tx| tx.compute_txid().to_byte_array())
        .collect();
    let tx_trie = merkle_nodes(leaves)?;

    Ok(BlockNodes {
        header,
        transactions,
        tx_trie,
    })
}

/// Interior merkle nodes, level by level; odd levels pair the last hash with itself.
fn merkle_nodes(mut level: Vec<[u8; 32]>) -> IndexResult<Vec<IpldNode>> {
    let mut nodes = Vec::new();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            let mut raw = Vec::with_capacity(64);
            raw.extend_from_slice(&pair[0]);
            raw.extend_from_slice(&pair[1]);
            next.push(sha256d::Hash::hash(&raw).to_byte_array());
            nodes.push(IpldNode::new(BITCOIN_TX_CODEC, raw)?);
        }
        level = next;
    }
    Ok(nodes)
}
