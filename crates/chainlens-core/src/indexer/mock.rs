use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bitcoin::OutPoint;

use crate::error::CoreError;
use crate::types::TxNode;

use super::{AddressIndexer, Balance, HistoryEntry, ScriptHash, ServerVersion, UnspentEntry};

/// In-memory indexer built from a fixed set of fully resolved transactions.
///
/// A transaction appears in a scripthash's history if it pays to the script
/// or spends an output locked by it, matching Electrum semantics.
pub struct MockIndexer {
    history: HashMap<ScriptHash, Vec<HistoryEntry>>,
    unspent: HashMap<ScriptHash, Vec<UnspentEntry>>,
}

impl MockIndexer {
    /// Inputs must carry `script_pub_key` for spends to be indexed.
    pub fn from_transactions(txs: &[TxNode]) -> Self {
        let spent: HashSet<OutPoint> = txs
            .iter()
            .flat_map(|tx| tx.inputs.iter().filter_map(|input| input.prevout))
            .collect();

        let mut history: HashMap<ScriptHash, Vec<HistoryEntry>> = HashMap::new();
        let mut unspent: HashMap<ScriptHash, Vec<UnspentEntry>> = HashMap::new();
        for tx in txs {
            let height = tx.block_height.map_or(0, |h| i64::from(h.0));
            let mut touched = HashSet::new();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let hash = ScriptHash::from_script(&output.script_pub_key);
                touched.insert(hash);
                let outpoint = OutPoint::new(tx.txid, vout as u32);
                if !spent.contains(&outpoint) && !output.script_pub_key.is_op_return() {
                    unspent.entry(hash).or_default().push(UnspentEntry {
                        tx_hash: tx.txid,
                        tx_pos: vout as u32,
                        height,
                        value: output.value.to_sat(),
                    });
                }
            }
            for input in &tx.inputs {
                if let Some(script) = &input.script_pub_key {
                    touched.insert(ScriptHash::from_script(script));
                }
            }
            for hash in touched {
                history.entry(hash).or_default().push(HistoryEntry {
                    tx_hash: tx.txid,
                    height,
                });
            }
        }

        Self { history, unspent }
    }
}

#[async_trait]
impl AddressIndexer for MockIndexer {
    async fn get_history(&self, scripthash: &ScriptHash) -> Result<Vec<HistoryEntry>, CoreError> {
        Ok(self.history.get(scripthash).cloned().unwrap_or_default())
    }

    async fn list_unspent(
        &self,
        scripthash: &ScriptHash,
    ) -> Result<Vec<UnspentEntry>, CoreError> {
        Ok(self.unspent.get(scripthash).cloned().unwrap_or_default())
    }

    async fn get_balance(&self, scripthash: &ScriptHash) -> Result<Balance, CoreError> {
        let confirmed = self
            .unspent
            .get(scripthash)
            .map_or(0, |entries| entries.iter().map(|e| e.value).sum());
        Ok(Balance {
            confirmed,
            unconfirmed: 0,
        })
    }

    async fn server_version(&self) -> Result<ServerVersion, CoreError> {
        Ok(ServerVersion {
            software: "mock".into(),
            protocol: "1.4".into(),
        })
    }
}
