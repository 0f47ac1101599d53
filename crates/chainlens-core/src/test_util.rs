//! Shared test helpers for `chainlens-core` unit tests.
//!
//! Builders for transactions with real P2WPKH scripts whose addresses are
//! distinct per "owner" byte, so clustering, tracing and exposure tests can
//! reason about addresses without hand-writing hex.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Txid};

use crate::enrich::address_for_script;
use crate::types::{BlockHeight, ScriptType, TxInput, TxNode, TxOutput};

// ==============================================================================
// Txid / Script Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// A P2WPKH script whose 20-byte program is filled with `owner`.
pub fn owner_script(owner: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[owner; 20]);
    ScriptBuf::from_bytes(bytes)
}

/// Regtest address for [`owner_script`].
pub fn owner_address(owner: u8) -> String {
    address_for_script(owner_script(owner).as_script(), Network::Regtest)
        .expect("p2wpkh script always has an address")
}

// ==============================================================================
// Transaction Builders
// ==============================================================================

/// Build a confirmed `TxNode` at height 100 with the given id.
pub fn make_raw_tx(txid: Txid, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> TxNode {
    TxNode {
        txid,
        version: 2,
        locktime: 0,
        size: 250,
        vsize: 140,
        weight: 560,
        block_hash: None,
        block_height: Some(BlockHeight(100)),
        block_time: Some(1_700_000_000),
        inputs,
        outputs,
    }
}

/// A coinbase input (no prevout).
pub fn coinbase_input() -> TxInput {
    TxInput {
        prevout: None,
        sequence: 0xFFFFFFFF,
        value: None,
        script_type: None,
        script_pub_key: None,
        address: None,
        witness_items: 0,
    }
}

/// An unresolved input spending `funding_txid:vout`. The gateway fills in
/// value, script and address from the funding transaction.
pub fn spending_input(funding_txid: Txid, vout: u32) -> TxInput {
    TxInput {
        prevout: Some(OutPoint::new(funding_txid, vout)),
        sequence: 0xFFFFFFFE,
        value: None,
        script_type: None,
        script_pub_key: None,
        address: None,
        witness_items: 2,
    }
}

/// A fully resolved input spending `funding_txid:vout` owned by `owner`.
pub fn owned_input(funding_txid: Txid, vout: u32, owner: u8, sats: u64) -> TxInput {
    TxInput {
        prevout: Some(OutPoint::new(funding_txid, vout)),
        sequence: 0xFFFFFFFE,
        value: Some(Amount::from_sat(sats)),
        script_type: Some(ScriptType::P2wpkh),
        script_pub_key: Some(owner_script(owner)),
        address: Some(owner_address(owner)),
        witness_items: 2,
    }
}

/// A P2WPKH output owned by `owner`.
pub fn owned_output(sats: u64, owner: u8) -> TxOutput {
    TxOutput {
        value: Amount::from_sat(sats),
        script_pub_key: owner_script(owner),
        script_type: ScriptType::P2wpkh,
        address: Some(owner_address(owner)),
    }
}

/// An OP_RETURN output carrying four bytes.
pub fn op_return_output() -> TxOutput {
    TxOutput {
        value: Amount::ZERO,
        script_pub_key: ScriptBuf::from_bytes(vec![0x6a, 0x04, 0xde, 0xad, 0xbe, 0xef]),
        script_type: ScriptType::OpReturn,
        address: None,
    }
}

// ==============================================================================
// Domain Type Builders
// ==============================================================================

/// Build a `TxInput` for fee-level tests. `value` is in satoshis.
pub fn make_input(value: Option<u64>, sequence: u32) -> TxInput {
    TxInput {
        prevout: Some(OutPoint::new(Txid::from_byte_array([0u8; 32]), 0)),
        sequence,
        value: value.map(Amount::from_sat),
        script_type: Some(ScriptType::P2wpkh),
        script_pub_key: None,
        address: None,
        witness_items: 2,
    }
}

/// Build a `TxOutput` with a P2WPKH script for fee-level tests.
pub fn make_output(sats: u64) -> TxOutput {
    owned_output(sats, 0x01)
}

/// Build a `TxNode` with the given inputs, outputs, and vsize.
pub fn make_tx_node(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, vsize: u64) -> TxNode {
    TxNode {
        vsize,
        size: vsize,
        weight: vsize * 4,
        ..make_raw_tx(Txid::from_byte_array([0u8; 32]), inputs, outputs)
    }
}

/// A Whirlpool-shaped transaction: five inputs from five distinct owners
/// (`first_owner..first_owner+5`) and five equal 1M-sat outputs.
pub fn whirlpool_tx(txid: Txid, first_owner: u8) -> TxNode {
    let inputs = (0..5u8)
        .map(|i| owned_input(txid_from_byte(0xE0 + i), 0, first_owner + i, 1_000_500))
        .collect();
    let outputs = (0..5u8)
        .map(|i| owned_output(1_000_000, first_owner + 0x40 + i))
        .collect();
    make_raw_tx(txid, inputs, outputs)
}
