//! Node access. [`BitcoinRpc`] is the seam the gateway talks through;
//! [`HttpRpcClient`] speaks to a real bitcoind and `mock::MockRpc` serves
//! canned transactions to unit tests.

mod http_adapter;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use http_adapter::HttpRpcClient;
pub use types::ChainInfo;

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};

use crate::error::CoreError;
use crate::types::{TxNode, TxOutput};

/// Read-only node queries used by [`ChainGateway`](crate::ChainGateway).
///
/// Inputs carry prevout value and script when the node hands them over;
/// the gateway fills the gaps and derives every address for its network,
/// so implementations leave `address` unset.
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    /// `TxNotFound` when the node knows no such transaction (it is neither
    /// in the mempool nor indexed with `-txindex`).
    async fn get_transaction(&self, txid: &Txid) -> Result<TxNode, CoreError>;

    /// Results are in `txids` order. The default fetches one at a time.
    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<TxNode>, CoreError> {
        let mut nodes = Vec::with_capacity(txids.len());
        for txid in txids {
            nodes.push(self.get_transaction(txid).await?);
        }
        Ok(nodes)
    }

    /// The output if it is currently unspent, mempool spends included;
    /// `None` once spent or if it never existed.
    async fn get_tx_out(&self, txid: &Txid, vout: u32) -> Result<Option<TxOutput>, CoreError>;

    /// [`get_tx_out`](Self::get_tx_out) for many outpoints, in order.
    async fn get_tx_outs(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<Vec<Option<TxOutput>>, CoreError> {
        let mut outputs = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            outputs.push(self.get_tx_out(&outpoint.txid, outpoint.vout).await?);
        }
        Ok(outputs)
    }

    async fn get_block_count(&self) -> Result<u64, CoreError>;

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError>;
}
