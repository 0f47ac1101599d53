//! Address-indexer abstraction (Electrum protocol).
//!
//! The node alone cannot answer "who spent this output" or "which outputs
//! does this address hold"; an Electrum-compatible indexer can. The gateway
//! treats it as optional and degrades when absent.

mod electrum;
#[cfg(test)]
pub mod mock;
mod scripthash;

pub use electrum::{ElectrumClient, ElectrumConfig};
pub use scripthash::ScriptHash;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ==============================================================================
// Indexer Results
// ==============================================================================

/// One entry of `blockchain.scripthash.get_history`.
///
/// `height` follows Electrum conventions: positive for confirmed, `0` for
/// mempool, `-1` for mempool with unconfirmed parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: Txid,
    pub height: i64,
}

/// One entry of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentEntry {
    pub tx_hash: Txid,
    pub tx_pos: u32,
    pub height: i64,
    /// Value in satoshis.
    pub value: u64,
}

/// Result of `blockchain.scripthash.get_balance`, in satoshis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: i64,
}

/// Result of `server.version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVersion {
    pub software: String,
    pub protocol: String,
}

// ==============================================================================
// Trait
// ==============================================================================

#[async_trait]
pub trait AddressIndexer: Send + Sync {
    async fn get_history(&self, scripthash: &ScriptHash) -> Result<Vec<HistoryEntry>, CoreError>;

    async fn list_unspent(&self, scripthash: &ScriptHash)
        -> Result<Vec<UnspentEntry>, CoreError>;

    async fn get_balance(&self, scripthash: &ScriptHash) -> Result<Balance, CoreError>;

    async fn server_version(&self) -> Result<ServerVersion, CoreError>;
}
