//! Per-request transaction graph.
//!
//! Holds every transaction fetched while answering one request together
//! with the spend relation discovered so far. Transactions are shared as
//! `Arc<TxNode>` with the gateway cache; the graph itself is owned by a
//! single analysis and discarded with its result.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::types::{SpendRef, TxNode, TxOutput};

/// A directed spending edge: `spending_txid` input `input_index` consumes
/// `funding_txid:funding_vout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpendEdge {
    pub funding_txid: Txid,
    pub funding_vout: u32,
    pub spending_txid: Txid,
    pub input_index: u32,
}

impl SpendEdge {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.funding_txid, self.funding_vout)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxGraph {
    txs: HashMap<Txid, Arc<TxNode>>,
    spends: HashMap<OutPoint, SpendRef>,
    edges: Vec<SpendEdge>,
}

impl TxGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction and record the spends of its inputs. Re-inserting
    /// a known transaction is a no-op.
    pub fn insert(&mut self, tx: Arc<TxNode>) {
        if self.txs.contains_key(&tx.txid) {
            return;
        }
        for (index, input) in tx.inputs.iter().enumerate() {
            if let Some(prevout) = input.prevout {
                self.record_spend(
                    prevout,
                    SpendRef {
                        txid: tx.txid,
                        input_index: index as u32,
                    },
                );
            }
        }
        self.txs.insert(tx.txid, tx);
    }

    /// Record that `spend` consumes `outpoint`. An outpoint can only be
    /// spent once, so a second record for the same outpoint is ignored.
    pub fn record_spend(&mut self, outpoint: OutPoint, spend: SpendRef) {
        if self.spends.contains_key(&outpoint) {
            return;
        }
        self.spends.insert(outpoint, spend);
        self.edges.push(SpendEdge {
            funding_txid: outpoint.txid,
            funding_vout: outpoint.vout,
            spending_txid: spend.txid,
            input_index: spend.input_index,
        });
    }

    pub fn get(&self, txid: &Txid) -> Option<&Arc<TxNode>> {
        self.txs.get(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.txs.get(&outpoint.txid)?.output(outpoint.vout)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<SpendRef> {
        self.spends.get(outpoint).copied()
    }

    /// Edges in discovery order.
    pub fn edges(&self) -> &[SpendEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Arc<TxNode>> {
        self.txs.values()
    }

    /// How many distinct graph transactions pay to `address`.
    pub fn receipts_to(&self, address: &str) -> usize {
        self.txs
            .values()
            .filter(|tx| {
                tx.outputs
                    .iter()
                    .any(|o| o.address.as_deref() == Some(address))
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn insert_records_input_spends() {
        let mut graph = TxGraph::new();
        let parent = make_raw_tx(
            txid_from_byte(1),
            vec![coinbase_input()],
            vec![owned_output(10_000, 1)],
        );
        let child = make_raw_tx(
            txid_from_byte(2),
            vec![spending_input(txid_from_byte(1), 0)],
            vec![owned_output(9_000, 2)],
        );
        graph.insert(Arc::new(parent));
        graph.insert(Arc::new(child.clone()));
        graph.insert(Arc::new(child));

        let outpoint = OutPoint::new(txid_from_byte(1), 0);
        assert_eq!(
            graph.spender_of(&outpoint),
            Some(SpendRef {
                txid: txid_from_byte(2),
                input_index: 0
            })
        );
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.edges()[0].outpoint(), outpoint);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.output(&outpoint).map(|o| o.value.to_sat()), Some(10_000));
    }

    #[test]
    fn receipts_count_address_reuse() {
        let mut graph = TxGraph::new();
        for b in 1..=3u8 {
            graph.insert(Arc::new(make_raw_tx(
                txid_from_byte(b),
                vec![coinbase_input()],
                vec![owned_output(1_000, 7)],
            )));
        }
        assert_eq!(graph.receipts_to(&owner_address(7)), 3);
        assert_eq!(graph.receipts_to(&owner_address(8)), 0);
    }
}
