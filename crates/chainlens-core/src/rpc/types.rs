//! RPC-specific types that do not belong to the shared domain model.
//!
//! Decoded transactions and outputs are represented directly as
//! [`TxNode`](crate::types::TxNode) / [`TxOutput`](crate::types::TxOutput);
//! this module only covers the remaining RPC results.

use bitcoin::{BlockHash, Network};
use serde::{Deserialize, Serialize};

// ==============================================================================
// Chain Info
// ==============================================================================

/// Basic chain information from `getblockchaininfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: BlockHash,
    pub pruned: bool,
}

impl ChainInfo {
    /// Map Bitcoin Core's chain name to a [`Network`] for address encoding.
    /// Unknown names fall back to mainnet.
    pub fn network(&self) -> Network {
        match self.chain.as_str() {
            "test" | "testnet" | "testnet4" => Network::Testnet,
            "signet" => Network::Signet,
            "regtest" => Network::Regtest,
            _ => Network::Bitcoin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_map_to_networks() {
        let info: ChainInfo = serde_json::from_value(serde_json::json!({
            "chain": "regtest",
            "blocks": 150,
            "bestblockhash": "0000000000000000000000000000000000000000000000000000000000000000",
            "pruned": false
        }))
        .unwrap();
        assert_eq!(info.network(), Network::Regtest);
        assert_eq!(
            ChainInfo {
                chain: "main".into(),
                ..info
            }
            .network(),
            Network::Bitcoin
        );
    }
}
