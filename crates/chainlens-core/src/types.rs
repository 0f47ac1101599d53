//! Domain types for the chainlens transaction model.
//!
//! Contains the fetched transaction types (`TxNode`, `TxInput`, `TxOutput`),
//! shared enums like `ScriptType`, `BlockHeight` and `Direction`, and input
//! validation helpers that run before any upstream call.

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Hard ceiling on any depth parameter accepted by the engine.
pub const HARD_MAX_DEPTH: u32 = 50;

// ==============================================================================
// Script Types
// ==============================================================================

/// Output template, as recognised by [`classify_script`](crate::enrich::classify_script).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pk,
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    BareMultisig,
    OpReturn,
    Unknown,
}

impl ScriptType {
    /// Same spelling as the serde form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P2pk => "p2pk",
            Self::P2pkh => "p2pkh",
            Self::P2sh => "p2sh",
            Self::P2wpkh => "p2wpkh",
            Self::P2wsh => "p2wsh",
            Self::P2tr => "p2tr",
            Self::BareMultisig => "bare_multisig",
            Self::OpReturn => "op_return",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Height of a confirmed block. Serialized as a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHeight(pub u32);

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ==============================================================================
// Transaction Types
// ==============================================================================

/// A fetched transaction. Immutable once it leaves the gateway, so it is
/// shared as `Arc<TxNode>` across concurrent traversal branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxNode {
    pub txid: Txid,
    pub version: i32,
    pub locktime: u32,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    pub block_hash: Option<BlockHash>,
    /// `None` while in the mempool.
    pub block_height: Option<BlockHeight>,
    /// Block timestamp (unix seconds), when confirmed.
    pub block_time: Option<u64>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl TxNode {
    /// Confirmations as of `tip`; a tx in the tip block has one.
    pub fn confirmations(&self, tip: BlockHeight) -> Option<u32> {
        let mined = self.block_height?;
        Some(tip.0.saturating_sub(mined.0) + 1)
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.inputs.as_slice(), [only] if only.prevout.is_none())
    }

    pub fn is_confirmed(&self) -> bool {
        self.block_height.is_some()
    }

    pub fn output(&self, vout: u32) -> Option<&TxOutput> {
        self.outputs.get(vout as usize)
    }

    /// Distinct addresses owning this transaction's inputs, in input order.
    /// Inputs whose prevout has not been resolved to an address are skipped.
    pub fn input_addresses(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.inputs
            .iter()
            .filter_map(|input| input.address.as_deref())
            .filter(|addr| seen.insert(*addr))
            .collect()
    }

    pub fn total_output_value(&self) -> Amount {
        self.outputs
            .iter()
            .fold(Amount::ZERO, |acc, output| acc + output.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInput {
    /// The outpoint being spent. `None` for coinbase inputs.
    pub prevout: Option<OutPoint>,
    pub sequence: u32,
    /// Value of the spent output, resolved from the funding transaction.
    /// `None` if prevout resolution failed.
    pub value: Option<Amount>,
    /// Script type of the spent output.
    pub script_type: Option<ScriptType>,
    /// scriptPubKey of the spent output, when resolved.
    pub script_pub_key: Option<ScriptBuf>,
    /// Display address of the spent output, when it has one.
    pub address: Option<String>,
    /// Number of witness stack items; zero for legacy spends.
    pub witness_items: usize,
}

/// A transaction output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: Amount,
    pub script_pub_key: ScriptBuf,
    pub script_type: ScriptType,
    /// Display address. Some scripts (OP_RETURN, bare multisig) have none.
    pub address: Option<String>,
}

// ==============================================================================
// Spend Relation
// ==============================================================================

/// Reference to the input that consumed an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpendRef {
    pub txid: Txid,
    pub input_index: u32,
}

/// Spend status of an output as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpendStatus {
    Spent(SpendRef),
    Unspent,
    /// Provably unspendable (OP_RETURN); never enters the UTXO set.
    Unspendable,
}

/// Traversal direction along the spend relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Ok(Self::Forward),
            "backward" | "back" => Ok(Self::Backward),
            other => Err(CoreError::InvalidInput(format!(
                "unknown direction `{other}`; expected forward or backward"
            ))),
        }
    }
}

// ==============================================================================
// Input Validation
// ==============================================================================

/// Parse a txid, requiring exactly 64 hex characters.
pub fn parse_txid(raw: &str) -> Result<Txid, CoreError> {
    let raw = raw.trim();
    if raw.len() != 64 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::InvalidInput(format!(
            "malformed txid `{raw}`: expected 64 hex characters"
        )));
    }
    raw.parse()
        .map_err(|e| CoreError::InvalidInput(format!("malformed txid `{raw}`: {e}")))
}

/// Parse `txid:vout`.
pub fn parse_outpoint(raw: &str) -> Result<OutPoint, CoreError> {
    let raw = raw.trim();
    let (txid, vout) = raw.split_once(':').ok_or_else(|| {
        CoreError::InvalidInput(format!("malformed outpoint `{raw}`: expected txid:vout"))
    })?;
    let vout = vout
        .parse()
        .map_err(|e| CoreError::InvalidInput(format!("malformed vout in `{raw}`: {e}")))?;
    Ok(OutPoint::new(parse_txid(txid)?, vout))
}

/// Reject depths above [`HARD_MAX_DEPTH`].
pub fn validate_depth(max_depth: u32) -> Result<u32, CoreError> {
    if max_depth > HARD_MAX_DEPTH {
        return Err(CoreError::InvalidInput(format!(
            "max_depth {max_depth} exceeds hard ceiling {HARD_MAX_DEPTH}"
        )));
    }
    Ok(max_depth)
}
