//! Transactional publisher: writes content blobs and relational rows together.
//!
//! One call to [`Publisher::publish`] is one transaction. Blobs are written with
//! `ON CONFLICT DO NOTHING`; header, transaction, input, and output rows are
//! upserted on their natural keys so re-publishing a block is idempotent apart
//! from the header's `times_validated` counter.

use crate::chain::types::{ConvertedPayload, TxInput, TxModel, TxOutput};
use crate::index::db::Database;
use crate::index::error::{to_sql_int, IndexError, IndexResult};
use crate::index::ipld::{nodes_for_block, IpldNode};
use crate::index::tx_guard::atomically;
use rusqlite::{params, Transaction};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Writes a converted block into the index.
pub trait Publisher: Send + Sync {
    fn publish(&self, payload: &ConvertedPayload) -> IndexResult<()>;
}

/// Publisher writing straight into the `blocks` table and the CID index.
#[derive(Debug, Clone)]
pub struct IpldPublisher {
    db: Database,
}

impl IpldPublisher {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl Publisher for IpldPublisher {
    fn publish(&self, payload: &ConvertedPayload) -> IndexResult<()> {
        let height = payload.height();
        let nodes = nodes_for_block(&payload.block)?;
        if nodes.transactions.len() != payload.transactions.len() {
            return Err(IndexError::InconsistentPayload {
                height,
                reason: format!(
                    "block has {} transactions but {} rows were converted",
                    nodes.transactions.len(),
                    payload.transactions.len()
                ),
            });
        }

        let header = &payload.block.header;
        let row = HeaderRow {
            block_number: to_sql_int("block_number", height)?,
            block_hash: payload.block_hash().to_string(),
            parent_hash: header.prev_blockhash.to_string(),
            cid: &nodes.header.cid,
            mh_key: &nodes.header.mh_key,
            timestamp: i64::from(header.time) * NANOS_PER_SECOND,
            bits: i64::from(header.bits.to_consensus()),
            node_id: self.db.node_id(),
        };

        let mut conn = self.db.conn()?;
        let header_id = atomically(&mut conn, |tx| {
            for node in &nodes.tx_trie {
                put_blob(tx, node)?;
            }

            put_blob(tx, &nodes.header)?;
            let header_id = upsert_header(tx, &row)?;

            for (model, node) in payload.transactions.iter().zip(&nodes.transactions) {
                put_blob(tx, node)?;
                let tx_id = upsert_transaction(tx, header_id, model, node)?;
                for input in &model.inputs {
                    upsert_input(tx, tx_id, input)?;
                }
                for output in &model.outputs {
                    upsert_output(tx, tx_id, output)?;
                }
            }

            Ok(header_id)
        })?;

        tracing::debug!(
            height,
            header_id,
            transactions = payload.transactions.len(),
            "published block"
        );
        Ok(())
    }
}

struct HeaderRow<'a> {
    block_number: i64,
    block_hash: String,
    parent_hash: String,
    cid: &'a str,
    mh_key: &'a str,
    timestamp: i64,
    bits: i64,
    node_id: &'a str,
}

fn put_blob(tx: &Transaction<'_>, node: &IpldNode) -> IndexResult<()> {
    tx.prepare_cached("INSERT INTO blocks (key, data) VALUES (?1, ?2) ON CONFLICT (key) DO NOTHING")?
        .execute(params![node.mh_key, node.raw])?;
    Ok(())
}

fn upsert_header(tx: &Transaction<'_>, row: &HeaderRow<'_>) -> IndexResult<i64> {
    let id = tx
        .prepare_cached(
            "INSERT INTO header_cids
                 (block_number, block_hash, parent_hash, cid, timestamp, bits, node_id, mh_key, times_validated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT (block_number, block_hash) DO UPDATE SET
                 parent_hash = excluded.parent_hash,
                 cid = excluded.cid,
                 timestamp = excluded.timestamp,
                 bits = excluded.bits,
                 node_id = excluded.node_id,
                 mh_key = excluded.mh_key,
                 times_validated = header_cids.times_validated + 1
             RETURNING id",
        )?
        .query_row(
            params![
                row.block_number,
                row.block_hash,
                row.parent_hash,
                row.cid,
                row.timestamp,
                row.bits,
                row.node_id,
                row.mh_key,
            ],
            |r| r.get(0),
        )?;
    Ok(id)
}

fn upsert_transaction(
    tx: &Transaction<'_>,
    header_id: i64,
    model: &TxModel,
    node: &IpldNode,
) -> IndexResult<i64> {
    let id = tx
        .prepare_cached(
            "INSERT INTO transaction_cids
                 (header_id, tx_hash, tx_index, cid, segwit, witness_hash, mh_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (header_id, tx_hash) DO UPDATE SET
                 tx_index = excluded.tx_index,
                 cid = excluded.cid,
                 segwit = excluded.segwit,
                 witness_hash = excluded.witness_hash,
                 mh_key = excluded.mh_key
             RETURNING id",
        )?
        .query_row(
            params![
                header_id,
                model.tx_hash,
                model.index,
                node.cid,
                model.segwit,
                model.witness_hash,
                node.mh_key,
            ],
            |r| r.get(0),
        )?;
    Ok(id)
}

fn upsert_input(tx: &Transaction<'_>, tx_id: i64, input: &TxInput) -> IndexResult<()> {
    let witness = serde_json::to_string(&input.witness)?;
    tx.prepare_cached(
        "INSERT INTO tx_inputs
             (tx_id, input_index, witness, sig_script, outpoint_tx_hash, outpoint_index)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (tx_id, input_index) DO UPDATE SET
             witness = excluded.witness,
             sig_script = excluded.sig_script,
             outpoint_tx_hash = excluded.outpoint_tx_hash,
             outpoint_index = excluded.outpoint_index",
    )?
    .execute(params![
        tx_id,
        input.index,
        witness,
        input.signature_script,
        input.outpoint_hash,
        input.outpoint_index,
    ])?;
    Ok(())
}

fn upsert_output(tx: &Transaction<'_>, tx_id: i64, output: &TxOutput) -> IndexResult<()> {
    let addresses = serde_json::to_string(&output.addresses)?;
    tx.prepare_cached(
        "INSERT INTO tx_outputs
             (tx_id, output_index, value, pk_script, script_class, addresses, required_sigs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (tx_id, output_index) DO UPDATE SET
             value = excluded.value,
             pk_script = excluded.pk_script,
             script_class = excluded.script_class,
             addresses = excluded.addresses,
             required_sigs = excluded.required_sigs",
    )?
    .execute(params![
        tx_id,
        output.index,
        output.value,
        output.pk_script,
        output.script_class.as_u8(),
        addresses,
        output.required_sigs,
    ])?;
    Ok(())
}
