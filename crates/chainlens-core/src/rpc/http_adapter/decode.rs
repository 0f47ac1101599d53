//! Typed views of `getrawtransaction` (verbosity 2) and `gettxout` replies,
//! converted into the crate's transaction model.

use bitcoin::{Amount, BlockHash, Denomination, OutPoint, ScriptBuf, Txid};
use serde::Deserialize;
use serde_json::Value;

use crate::enrich::classify_script;
use crate::error::CoreError;
use crate::types::{BlockHeight, TxInput, TxNode, TxOutput};

#[derive(Debug, Deserialize)]
pub(super) struct VerboseTx {
    txid: Txid,
    version: i32,
    locktime: u32,
    size: u64,
    vsize: u64,
    weight: u64,
    #[serde(default)]
    blockhash: Option<BlockHash>,
    /// Only reported by v26+ nodes.
    #[serde(default)]
    blockheight: Option<u32>,
    #[serde(default)]
    confirmations: Option<i64>,
    #[serde(default)]
    blocktime: Option<u64>,
    vin: Vec<VerboseInput>,
    vout: Vec<VerboseOutput>,
}

#[derive(Debug, Deserialize)]
struct VerboseInput {
    #[serde(default)]
    coinbase: Option<String>,
    #[serde(default)]
    txid: Option<Txid>,
    #[serde(default)]
    vout: Option<u32>,
    sequence: u32,
    #[serde(default)]
    txinwitness: Vec<String>,
    /// Present at verbosity 2 on v25+ nodes.
    #[serde(default)]
    prevout: Option<SpentOutput>,
}

#[derive(Debug, Deserialize)]
struct SpentOutput {
    value: Value,
    #[serde(rename = "scriptPubKey")]
    script: ScriptHex,
}

#[derive(Debug, Deserialize)]
struct VerboseOutput {
    value: Value,
    #[serde(default)]
    n: Option<usize>,
    #[serde(rename = "scriptPubKey")]
    script: ScriptHex,
}

#[derive(Debug, Deserialize)]
struct ScriptHex {
    hex: String,
}

impl ScriptHex {
    fn decode(&self) -> Result<ScriptBuf, CoreError> {
        ScriptBuf::from_hex(&self.hex)
            .map_err(|e| CoreError::InvalidTxData(format!("scriptPubKey `{}`: {e}", self.hex)))
    }
}

impl VerboseTx {
    pub(super) fn from_reply(raw: Value) -> Result<Self, CoreError> {
        serde_json::from_value(raw)
            .map_err(|e| CoreError::InvalidTxData(format!("getrawtransaction reply: {e}")))
    }

    /// Block whose height must be looked up separately: confirmed, but the
    /// node did not report `blockheight`.
    pub(super) fn block_needing_height(&self) -> Option<BlockHash> {
        if self.blockheight.is_some() || self.confirmations.unwrap_or(0) <= 0 {
            return None;
        }
        self.blockhash
    }

    /// Build the node. `looked_up_height` fills in for a missing
    /// `blockheight` field.
    pub(super) fn into_node(self, looked_up_height: Option<BlockHeight>) -> Result<TxNode, CoreError> {
        let block_height = self.blockheight.map(BlockHeight).or(looked_up_height);
        let inputs = self
            .vin
            .into_iter()
            .map(VerboseInput::into_input)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self
            .vout
            .into_iter()
            .enumerate()
            .map(|(index, output)| output.into_output(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TxNode {
            txid: self.txid,
            version: self.version,
            locktime: self.locktime,
            size: self.size,
            vsize: self.vsize,
            weight: self.weight,
            block_hash: self.blockhash,
            block_height,
            block_time: self.blocktime,
            inputs,
            outputs,
        })
    }
}

impl VerboseInput {
    fn into_input(self) -> Result<TxInput, CoreError> {
        let prevout = match (self.coinbase, self.txid, self.vout) {
            (Some(_), _, _) => None,
            (None, Some(txid), Some(vout)) => Some(OutPoint::new(txid, vout)),
            (None, _, _) => {
                return Err(CoreError::InvalidTxData(
                    "non-coinbase input without txid/vout".to_owned(),
                ))
            }
        };

        // A prevout the node could not describe is left for the gateway to
        // resolve from the funding transaction.
        let (value, script_pub_key) = match &self.prevout {
            Some(spent) => (btc_amount(&spent.value).ok(), spent.script.decode().ok()),
            None => (None, None),
        };

        Ok(TxInput {
            prevout,
            sequence: self.sequence,
            value,
            script_type: script_pub_key.as_deref().map(classify_script),
            script_pub_key,
            address: None,
            witness_items: self.txinwitness.len(),
        })
    }
}

impl VerboseOutput {
    fn into_output(self, index: usize) -> Result<TxOutput, CoreError> {
        if let Some(n) = self.n.filter(|n| *n != index) {
            return Err(CoreError::InvalidTxData(format!(
                "output at position {index} claims n={n}"
            )));
        }
        let script_pub_key = self.script.decode()?;
        Ok(TxOutput {
            value: btc_amount(&self.value)?,
            script_type: classify_script(&script_pub_key),
            script_pub_key,
            address: None,
        })
    }
}

/// Decode a `gettxout` reply. JSON `null` means spent or never existed.
pub(super) fn unspent_output(raw: Value) -> Result<Option<TxOutput>, CoreError> {
    #[derive(Deserialize)]
    struct UtxoEntry {
        value: Value,
        #[serde(rename = "scriptPubKey")]
        script: ScriptHex,
    }

    if raw.is_null() {
        return Ok(None);
    }
    let entry: UtxoEntry = serde_json::from_value(raw)
        .map_err(|e| CoreError::InvalidTxData(format!("gettxout reply: {e}")))?;
    VerboseOutput {
        value: entry.value,
        n: None,
        script: entry.script,
    }
    .into_output(0)
    .map(Some)
}

/// Bitcoin Core prints amounts as JSON numbers in BTC, occasionally in
/// exponent form (`6.6e-06`). Strings are accepted in plain decimal only.
pub(super) fn btc_amount(value: &Value) -> Result<Amount, CoreError> {
    let parsed = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{n} is not representable"))
            .and_then(|btc| {
                Amount::from_float_in(btc, Denomination::Bitcoin).map_err(|e| e.to_string())
            }),
        Value::String(s) => {
            Amount::from_str_in(s, Denomination::Bitcoin).map_err(|e| e.to_string())
        }
        other => Err(format!("expected a number, got {other}")),
    };
    parsed.map_err(|reason| CoreError::InvalidTxData(format!("BTC amount {value}: {reason}")))
}
