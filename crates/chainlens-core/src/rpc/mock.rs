use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};

use crate::error::CoreError;
use crate::types::{TxNode, TxOutput};

use super::types::ChainInfo;
use super::BitcoinRpc;

/// A mock Bitcoin RPC backend for testing. Serves canned transactions from a
/// `HashMap` populated via the builder pattern.
///
/// `gettxout` semantics follow the node: an output is in the UTXO set only
/// if no canned transaction spends it. Input prevout data is stripped on
/// fetch so the gateway's own prevout resolution is exercised.
pub struct MockRpc {
    transactions: HashMap<Txid, TxNode>,
    spent: HashSet<OutPoint>,
    failing: HashSet<Txid>,
    chain_info: ChainInfo,
    fetches: AtomicUsize,
}

impl MockRpc {
    pub fn builder() -> MockRpcBuilder {
        MockRpcBuilder {
            transactions: HashMap::new(),
            failing: HashSet::new(),
            chain_info: ChainInfo {
                chain: "regtest".into(),
                blocks: 200,
                best_block_hash: BlockHash::all_zeros(),
                pruned: false,
            },
        }
    }

    /// Number of `get_transaction` calls served (including failures).
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

pub struct MockRpcBuilder {
    transactions: HashMap<Txid, TxNode>,
    failing: HashSet<Txid>,
    chain_info: ChainInfo,
}

impl MockRpcBuilder {
    pub fn with_tx(mut self, tx: TxNode) -> Self {
        self.transactions.insert(tx.txid, tx);
        self
    }

    pub fn with_txs(self, txs: impl IntoIterator<Item = TxNode>) -> Self {
        txs.into_iter().fold(self, Self::with_tx)
    }

    /// Make every fetch of `txid` fail with a connection-level error.
    pub fn with_unavailable(mut self, txid: Txid) -> Self {
        self.failing.insert(txid);
        self
    }

    pub fn with_chain_info(mut self, info: ChainInfo) -> Self {
        self.chain_info = info;
        self
    }

    pub fn build(self) -> MockRpc {
        let spent = self
            .transactions
            .values()
            .flat_map(|tx| tx.inputs.iter().filter_map(|input| input.prevout))
            .collect();
        MockRpc {
            transactions: self.transactions,
            spent,
            failing: self.failing,
            chain_info: self.chain_info,
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BitcoinRpc for MockRpc {
    async fn get_transaction(&self, txid: &Txid) -> Result<TxNode, CoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(txid) {
            return Err(CoreError::unavailable(
                format!("fetch transaction {txid}"),
                "connection refused",
            ));
        }
        let mut tx = self
            .transactions
            .get(txid)
            .cloned()
            .ok_or(CoreError::TxNotFound(*txid))?;
        for input in &mut tx.inputs {
            input.value = None;
            input.script_type = None;
            input.script_pub_key = None;
            input.address = None;
        }
        for output in &mut tx.outputs {
            output.address = None;
        }
        Ok(tx)
    }

    async fn get_tx_out(&self, txid: &Txid, vout: u32) -> Result<Option<TxOutput>, CoreError> {
        if self.spent.contains(&OutPoint::new(*txid, vout)) {
            return Ok(None);
        }
        Ok(self
            .transactions
            .get(txid)
            .and_then(|tx| tx.outputs.get(vout as usize))
            .filter(|output| !output.script_pub_key.is_op_return())
            .cloned())
    }

    async fn get_block_count(&self) -> Result<u64, CoreError> {
        Ok(self.chain_info.blocks)
    }

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        Ok(self.chain_info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use bitcoin::Amount;

    #[tokio::test]
    async fn with_chain_info_overrides_defaults() {
        let custom_info = ChainInfo {
            chain: "main".into(),
            blocks: 800_000,
            best_block_hash: BlockHash::all_zeros(),
            pruned: true,
        };
        let rpc = MockRpc::builder().with_chain_info(custom_info).build();
        let info = rpc.get_blockchain_info().await.unwrap();
        assert_eq!(info.chain, "main");
        assert_eq!(rpc.get_block_count().await.unwrap(), 800_000);
        assert!(info.pruned);
    }

    #[tokio::test]
    async fn get_tx_outs_excludes_spent_outputs() {
        let funding = txid_from_byte(1);
        let fund_tx = make_raw_tx(
            funding,
            vec![coinbase_input()],
            vec![owned_output(5000, 1), owned_output(3000, 2)],
        );
        let spend_tx = make_raw_tx(
            txid_from_byte(2),
            vec![spending_input(funding, 0)],
            vec![owned_output(4000, 3)],
        );

        let rpc = MockRpc::builder().with_txs([fund_tx, spend_tx]).build();
        let outpoints = vec![
            OutPoint::new(funding, 0),
            OutPoint::new(funding, 1),
            OutPoint::new(funding, 99),
        ];
        let results = rpc.get_tx_outs(&outpoints).await.unwrap();
        assert!(results[0].is_none(), "spent output must not be in UTXO set");
        assert_eq!(results[1].as_ref().unwrap().value, Amount::from_sat(3000));
        assert!(results[2].is_none());
    }

    #[tokio::test]
    async fn unavailable_txid_fails_transiently() {
        let txid = txid_from_byte(9);
        let rpc = MockRpc::builder().with_unavailable(txid).build();
        let err = rpc.get_transaction(&txid).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rpc.fetch_count(), 1);
    }
}
