//! Synthetic blocks for unit tests.

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
    TxMerkleNode, TxIn, TxOut, Txid, Witness,
};

pub(crate) fn p2pkh_script(seed: u8) -> ScriptBuf {
    let mut bytes = vec![0x76, 0xa9, 0x14];
    bytes.extend_from_slice(&[seed; 20]);
    bytes.extend_from_slice(&[0x88, 0xac]);
    ScriptBuf::from_bytes(bytes)
}

pub(crate) fn p2wpkh_script(seed: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[seed; 20]);
    ScriptBuf::from_bytes(bytes)
}

pub(crate) fn op_return_script(data: &[u8]) -> ScriptBuf {
    let mut bytes = vec![0x6a, data.len() as u8];
    bytes.extend_from_slice(data);
    ScriptBuf::from_bytes(bytes)
}

pub(crate) fn sample_tx(seed: u8, segwit: bool) -> Transaction {
    let previous_output = OutPoint {
        txid: Txid::from_byte_array([seed; 32]),
        vout: u32::from(seed),
    };
    let witness = if segwit {
        Witness::from_slice(&[vec![0x30, seed], vec![0x02, seed, seed]])
    } else {
        Witness::new()
    };

    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output,
            script_sig: ScriptBuf::from_bytes(vec![0x01, seed]),
            sequence: Sequence::MAX,
            witness,
        }],
        output: vec![
            TxOut {
                value: Amount::from_sat(1_000 + u64::from(seed)),
                script_pubkey: p2pkh_script(seed),
            },
            TxOut {
                value: Amount::from_sat(0),
                script_pubkey: op_return_script(&[seed, 0xfe]),
            },
        ],
    }
}

pub(crate) fn block_with_txs(prev: BlockHash, salt: u32, txdata: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: Header {
            version: Version::from_consensus(1),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000 + salt,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: salt,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

/// A block at `height` with `tx_count` distinct transactions.
pub(crate) fn sample_block(height: u64, prev: BlockHash, tx_count: u8) -> Block {
    let txs = (0..tx_count)
        .map(|offset| sample_tx((height as u8).wrapping_mul(16).wrapping_add(offset), offset % 2 == 1))
        .collect();
    block_with_txs(prev, height as u32, txs)
}
