use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use quick_cache::sync::Cache as QuickCache;

use crate::types::{ScriptType, TxNode};

/// Default capacity of the transaction cache.
pub const DEFAULT_TX_CAPACITY: usize = 20_000;
/// Default capacity of the prevout cache.
pub const DEFAULT_PREVOUT_CAPACITY: usize = 100_000;
/// Unconfirmed transactions are refetched after this long.
pub const DEFAULT_UNCONFIRMED_TTL: Duration = Duration::from_secs(30);

// ==============================================================================
// Prevout Cache Entry
// ==============================================================================

/// Cached information about a previous output, used to enrich inputs
/// with value, script and address without re-fetching the full transaction.
#[derive(Debug, Clone)]
pub struct PrevoutInfo {
    pub value: Amount,
    pub script_pub_key: ScriptBuf,
    pub script_type: ScriptType,
    pub address: Option<String>,
}

#[derive(Clone)]
struct CachedTx {
    node: Arc<TxNode>,
    fetched_at: Instant,
}

// ==============================================================================
// Cache
// ==============================================================================

/// Bounded in-memory caches for decoded transactions and resolved prevouts.
///
/// Shared across concurrent requests via `Arc<Cache>`. Confirmed
/// transactions never expire (only evicted under capacity pressure);
/// unconfirmed ones are treated as missing once older than the TTL.
pub struct Cache {
    transactions: QuickCache<Txid, CachedTx>,
    prevouts: QuickCache<OutPoint, PrevoutInfo>,
    unconfirmed_ttl: Duration,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_capacity(
            DEFAULT_TX_CAPACITY,
            DEFAULT_PREVOUT_CAPACITY,
            DEFAULT_UNCONFIRMED_TTL,
        )
    }

    pub fn with_capacity(tx_capacity: usize, prevout_capacity: usize, ttl: Duration) -> Self {
        Self {
            transactions: QuickCache::new(tx_capacity.max(1)),
            prevouts: QuickCache::new(prevout_capacity.max(1)),
            unconfirmed_ttl: ttl,
        }
    }

    pub fn get_tx(&self, txid: &Txid) -> Option<Arc<TxNode>> {
        let entry = self.transactions.get(txid)?;
        if !entry.node.is_confirmed() && entry.fetched_at.elapsed() >= self.unconfirmed_ttl {
            self.transactions.remove(txid);
            return None;
        }
        Some(entry.node)
    }

    pub fn insert_tx(&self, node: Arc<TxNode>) {
        self.transactions.insert(
            node.txid,
            CachedTx {
                node,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn get_prevout(&self, outpoint: &OutPoint) -> Option<PrevoutInfo> {
        self.prevouts.get(outpoint)
    }

    pub fn insert_prevout(&self, outpoint: OutPoint, info: PrevoutInfo) {
        self.prevouts.insert(outpoint, info);
    }

    /// Record every output of `node` as a prevout so later spenders resolve
    /// without another fetch.
    pub fn insert_outputs_as_prevouts(&self, node: &TxNode) {
        for (vout, output) in node.outputs.iter().enumerate() {
            self.insert_prevout(
                OutPoint::new(node.txid, vout as u32),
                PrevoutInfo {
                    value: output.value,
                    script_pub_key: output.script_pub_key.clone(),
                    script_type: output.script_type,
                    address: output.address.clone(),
                },
            );
        }
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{make_raw_tx, owned_output, txid_from_byte};

    #[test]
    fn confirmed_entries_survive_zero_ttl() {
        let cache = Cache::with_capacity(16, 16, Duration::ZERO);
        let tx = make_raw_tx(txid_from_byte(1), vec![], vec![owned_output(1_000, 1)]);
        cache.insert_tx(Arc::new(tx));
        assert!(cache.get_tx(&txid_from_byte(1)).is_some());
    }

    #[test]
    fn unconfirmed_entries_expire_after_ttl() {
        let cache = Cache::with_capacity(16, 16, Duration::ZERO);
        let mut tx = make_raw_tx(txid_from_byte(2), vec![], vec![owned_output(1_000, 1)]);
        tx.block_height = None;
        cache.insert_tx(Arc::new(tx));
        assert!(cache.get_tx(&txid_from_byte(2)).is_none());
        assert_eq!(cache.tx_count(), 0);
    }

    #[test]
    fn outputs_become_prevouts() {
        let cache = Cache::new();
        let tx = make_raw_tx(
            txid_from_byte(3),
            vec![],
            vec![owned_output(1_000, 1), owned_output(2_000, 2)],
        );
        cache.insert_outputs_as_prevouts(&tx);
        let info = cache
            .get_prevout(&OutPoint::new(txid_from_byte(3), 1))
            .expect("prevout cached");
        assert_eq!(info.value, Amount::from_sat(2_000));
        assert!(info.address.is_some());
    }
}
