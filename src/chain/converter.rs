//! Turns raw node blocks into the rows the publisher indexes.

use crate::chain::types::{ConvertedPayload, RawBlock, ScriptClass, TxInput, TxModel, TxOutput};
use anyhow::{Context, Result};
use bitcoin::blockdata::script::Instruction;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::{Address, Network, PublicKey, Script, Transaction};

/// Converts a fetched block into a publishable payload.
///
/// Failures are reported per block; callers log and move on.
pub trait Converter: Send + Sync {
    fn convert(&self, raw: RawBlock) -> Result<ConvertedPayload>;
}

/// Converter for Bitcoin blocks. The network only affects address encoding.
#[derive(Debug, Clone, Copy)]
pub struct BitcoinConverter {
    network: Network,
}

impl BitcoinConverter {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn convert_tx(&self, index: usize, tx: &Transaction) -> Result<TxModel> {
        let segwit = tx.input.iter().any(|input| !input.witness.is_empty());
        let tx_hash = tx.compute_txid().to_string();

        let inputs = tx
            .input
            .iter()
            .enumerate()
            .map(|(input_index, input)| TxInput {
                index: input_index as i64,
                witness: input.witness.iter().map(hex::encode).collect(),
                signature_script: input.script_sig.to_bytes(),
                outpoint_hash: input.previous_output.txid.to_string(),
                outpoint_index: input.previous_output.vout,
            })
            .collect();

        let mut outputs = Vec::with_capacity(tx.output.len());
        for (output_index, output) in tx.output.iter().enumerate() {
            let value = i64::try_from(output.value.to_sat()).with_context(|| {
                format!("output {output_index} of tx {tx_hash} has an out-of-range value")
            })?;
            let (script_class, addresses, required_sigs) =
                classify_script(&output.script_pubkey, self.network);
            outputs.push(TxOutput {
                index: output_index as i64,
                value,
                pk_script: output.script_pubkey.to_bytes(),
                script_class,
                addresses,
                required_sigs,
            });
        }

        Ok(TxModel {
            witness_hash: segwit.then(|| tx.compute_wtxid().to_string()),
            tx_hash,
            index: index as i64,
            segwit,
            inputs,
            outputs,
        })
    }
}

impl Default for BitcoinConverter {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}

impl Converter for BitcoinConverter {
    fn convert(&self, raw: RawBlock) -> Result<ConvertedPayload> {
        let RawBlock { height, block } = raw;
        let transactions = block
            .txdata
            .iter()
            .enumerate()
            .map(|(index, tx)| self.convert_tx(index, tx))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("failed to convert block at height {height}"))?;

        Ok(ConvertedPayload {
            height,
            block,
            transactions,
        })
    }
}

/// Classifies an output script and extracts the addresses it pays to.
///
/// Returns `(class, addresses, required_sigs)`. Scripts that match no template are
/// `NonStandard` with no addresses, which is not an error.
pub fn classify_script(script: &Script, network: Network) -> (ScriptClass, Vec<String>, i64) {
    if script.is_op_return() {
        return (ScriptClass::NullData, Vec::new(), 0);
    }

    let class = if script.is_p2pkh() {
        Some(ScriptClass::PubKeyHash)
    } else if script.is_p2sh() {
        Some(ScriptClass::ScriptHash)
    } else if script.is_p2wpkh() {
        Some(ScriptClass::WitnessV0PubKeyHash)
    } else if script.is_p2wsh() {
        Some(ScriptClass::WitnessV0ScriptHash)
    } else if script.is_p2tr() {
        Some(ScriptClass::WitnessV1Taproot)
    } else {
        None
    };
    if let Some(class) = class {
        let addresses = Address::from_script(script, network)
            .map(|address| vec![address.to_string()])
            .unwrap_or_default();
        return (class, addresses, 1);
    }

    if let Some(pubkey) = p2pk_pubkey(script) {
        let address = Address::p2pkh(pubkey.pubkey_hash(), network);
        return (ScriptClass::PubKey, vec![address.to_string()], 1);
    }

    if let Some((required, pubkeys)) = parse_multisig(script) {
        let addresses = pubkeys
            .into_iter()
            .map(|pubkey| Address::p2pkh(pubkey.pubkey_hash(), network).to_string())
            .collect();
        return (ScriptClass::MultiSig, addresses, required);
    }

    if script.is_witness_program() {
        let addresses: Vec<String> = Address::from_script(script, network)
            .map(|address| vec![address.to_string()])
            .unwrap_or_default();
        let required = if addresses.is_empty() { 0 } else { 1 };
        return (ScriptClass::WitnessUnknown, addresses, required);
    }

    (ScriptClass::NonStandard, Vec::new(), 0)
}

fn p2pk_pubkey(script: &Script) -> Option<PublicKey> {
    let bytes = script.as_bytes();
    let (&push_len, rest) = bytes.split_first()?;
    let (&last, key) = rest.split_last()?;
    if last != 0xac || key.len() != usize::from(push_len) || !matches!(push_len, 33 | 65) {
        return None;
    }
    PublicKey::from_slice(key).ok()
}

fn parse_multisig(script: &Script) -> Option<(i64, Vec<PublicKey>)> {
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let (first, rest) = instructions.split_first()?;
    let (last, middle) = rest.split_last()?;
    let (total_op, key_pushes) = middle.split_last()?;

    if *last != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }
    let required = small_int(first)?;
    let total = small_int(total_op)?;
    if required > total || key_pushes.len() as i64 != total {
        return None;
    }

    let mut pubkeys = Vec::with_capacity(key_pushes.len());
    for push in key_pushes {
        match push {
            Instruction::PushBytes(bytes) => pubkeys.push(PublicKey::from_slice(bytes.as_bytes()).ok()?),
            Instruction::Op(_) => return None,
        }
    }

    Some((required, pubkeys))
}

fn small_int(instruction: &Instruction<'_>) -> Option<i64> {
    match instruction {
        Instruction::Op(op) => {
            let code = op.to_u8();
            (0x51..=0x60).contains(&code).then(|| i64::from(code - 0x50))
        }
        Instruction::PushBytes(_) => None,
    }
}
