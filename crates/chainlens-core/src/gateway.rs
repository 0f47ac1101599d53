//! Chain data gateway.
//!
//! Normalizes node RPC and optional address-indexer lookups into one query
//! surface. Owns the transaction/prevout cache, the retry policy and the
//! semaphore that bounds concurrent upstream calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Txid};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::cache::{Cache, PrevoutInfo};
use crate::enrich::{address_for_script, classify_script};
use crate::error::CoreError;
use crate::indexer::{AddressIndexer, Balance, HistoryEntry, ScriptHash};
use crate::retry::{retry, RetryPolicy};
use crate::rpc::{BitcoinRpc, ChainInfo};
use crate::types::{BlockHeight, SpendRef, SpendStatus, TxNode};

/// Uncached spending candidates fetched per round trip.
const SPEND_SCAN_CHUNK: usize = 25;

// ==============================================================================
// Configuration
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Maximum number of upstream calls in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub tx_cache_capacity: usize,
    pub prevout_cache_capacity: usize,
    pub unconfirmed_ttl_secs: u64,
    /// Uncached history transactions fetched while looking for the spender
    /// of one output before giving up.
    pub spend_scan_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            tx_cache_capacity: crate::cache::DEFAULT_TX_CAPACITY,
            prevout_cache_capacity: crate::cache::DEFAULT_PREVOUT_CAPACITY,
            unconfirmed_ttl_secs: crate::cache::DEFAULT_UNCONFIRMED_TTL.as_secs(),
            spend_scan_limit: 500,
        }
    }
}

/// An unspent output held by an address, as reported by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// `None` while unconfirmed.
    pub height: Option<BlockHeight>,
    pub address: String,
}

// ==============================================================================
// Gateway
// ==============================================================================

pub struct ChainGateway {
    rpc: Arc<dyn BitcoinRpc>,
    indexer: Option<Arc<dyn AddressIndexer>>,
    cache: Cache,
    network: Network,
    retry: RetryPolicy,
    permits: Semaphore,
    spend_scan_limit: usize,
}

impl ChainGateway {
    pub fn new(
        rpc: Arc<dyn BitcoinRpc>,
        indexer: Option<Arc<dyn AddressIndexer>>,
        network: Network,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            rpc,
            indexer,
            cache: Cache::with_capacity(
                config.tx_cache_capacity,
                config.prevout_cache_capacity,
                Duration::from_secs(config.unconfirmed_ttl_secs),
            ),
            network,
            retry: config.retry.clone(),
            permits: Semaphore::new(config.concurrency.max(1)),
            spend_scan_limit: config.spend_scan_limit.max(1),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn indexer_enabled(&self) -> bool {
        self.indexer.is_some()
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, CoreError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| CoreError::unavailable("acquire upstream permit", e))
    }

    fn indexer(&self, what: &'static str) -> Result<&Arc<dyn AddressIndexer>, CoreError> {
        self.indexer.as_ref().ok_or(CoreError::IndexerRequired(what))
    }

    // -- node lookups ---------------------------------------------------------

    pub async fn chain_info(&self) -> Result<ChainInfo, CoreError> {
        retry(&self.retry, "getblockchaininfo", || async move {
            let _permit = self.permit().await?;
            self.rpc.get_blockchain_info().await
        })
        .await
    }

    pub async fn tip_height(&self) -> Result<BlockHeight, CoreError> {
        let blocks = retry(&self.retry, "getblockcount", || async move {
            let _permit = self.permit().await?;
            self.rpc.get_block_count().await
        })
        .await?;
        u32::try_from(blocks)
            .map(BlockHeight)
            .map_err(|_| CoreError::InvalidTxData(format!("block count {blocks} out of range")))
    }

    /// Whether the node's UTXO set (mempool included) still holds `outpoint`.
    pub async fn is_unspent(&self, outpoint: OutPoint) -> Result<bool, CoreError> {
        let what = format!("gettxout {outpoint}");
        let out = retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            self.rpc.get_tx_out(&outpoint.txid, outpoint.vout).await
        })
        .await?;
        Ok(out.is_some())
    }

    /// Fetch a transaction with inputs enriched (value, script, address)
    /// wherever the funding outputs can be resolved.
    ///
    /// `TxNotFound` is returned without retry. Inputs whose funding
    /// transaction the node does not know keep `value: None`, leaving the
    /// fee unknown. Any other failure while resolving prevouts is returned
    /// and nothing is cached.
    pub async fn get_transaction(&self, txid: &Txid) -> Result<Arc<TxNode>, CoreError> {
        if let Some(node) = self.cache.get_tx(txid) {
            return Ok(node);
        }
        let node = self.fetch_raw(txid).await?;
        self.complete(node).await
    }

    /// Annotate and resolve a freshly fetched node, then cache it.
    async fn complete(&self, mut node: TxNode) -> Result<Arc<TxNode>, CoreError> {
        self.annotate_outputs(&mut node);
        self.resolve_prevouts(&mut node).await?;

        let node = Arc::new(node);
        self.cache.insert_outputs_as_prevouts(&node);
        self.cache.insert_tx(Arc::clone(&node));
        Ok(node)
    }

    async fn fetch_raw(&self, txid: &Txid) -> Result<TxNode, CoreError> {
        let what = format!("fetch transaction {txid}");
        retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            self.rpc.get_transaction(txid).await
        })
        .await
    }

    async fn fetch_raw_batch(&self, txids: &[Txid]) -> Result<Vec<TxNode>, CoreError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let what = format!("fetch {} transactions", txids.len());
        retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            self.rpc.get_transactions(txids).await
        })
        .await
    }

    /// Fetch `txids`, skipping those the node does not know. A batch that
    /// trips over one unknown txid is retried one transaction at a time so
    /// the rest still arrive. Every other failure is returned.
    async fn fetch_available(&self, txids: &[Txid]) -> Result<Vec<TxNode>, CoreError> {
        let missing = match self.fetch_raw_batch(txids).await {
            Err(CoreError::TxNotFound(missing)) => missing,
            other => return other,
        };
        debug!(%missing, requested = txids.len(), "batch hit an unknown txid; fetching one by one");

        let mut found = Vec::with_capacity(txids.len());
        for result in join_all(txids.iter().map(|txid| self.fetch_raw(txid))).await {
            match result {
                Ok(node) => found.push(node),
                Err(CoreError::TxNotFound(txid)) => debug!(%txid, "skipping unknown transaction"),
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    fn annotate_outputs(&self, node: &mut TxNode) {
        for output in &mut node.outputs {
            if output.address.is_none() {
                output.address = address_for_script(&output.script_pub_key, self.network);
            }
        }
    }

    async fn resolve_prevouts(&self, node: &mut TxNode) -> Result<(), CoreError> {
        let mut missing: Vec<Txid> = Vec::new();
        let mut seen = HashSet::new();

        for input in &mut node.inputs {
            let Some(prevout) = input.prevout else {
                continue;
            };
            if let (Some(value), Some(script)) = (input.value, input.script_pub_key.as_ref()) {
                // Node supplied the prevout (verbosity 2).
                let address = address_for_script(script, self.network);
                input.address = address.clone();
                input.script_type = Some(classify_script(script));
                self.cache.insert_prevout(
                    prevout,
                    PrevoutInfo {
                        value,
                        script_pub_key: script.clone(),
                        script_type: classify_script(script),
                        address,
                    },
                );
                continue;
            }
            if let Some(info) = self.cache.get_prevout(&prevout) {
                apply_prevout(input, info);
                continue;
            }
            if let Some(funding) = self.cache.get_tx(&prevout.txid) {
                self.cache.insert_outputs_as_prevouts(&funding);
                if let Some(info) = self.cache.get_prevout(&prevout) {
                    apply_prevout(input, info);
                    continue;
                }
            }
            if seen.insert(prevout.txid) {
                missing.push(prevout.txid);
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        debug!(
            txid = %node.txid,
            funding_txs = missing.len(),
            "resolving prevouts from funding transactions"
        );
        for mut funding in self.fetch_available(&missing).await? {
            self.annotate_outputs(&mut funding);
            self.cache.insert_outputs_as_prevouts(&funding);
        }

        let mut unresolved = 0usize;
        for input in node.inputs.iter_mut().filter(|input| input.value.is_none()) {
            match input.prevout.and_then(|p| self.cache.get_prevout(&p)) {
                Some(info) => apply_prevout(input, info),
                None if input.prevout.is_some() => unresolved += 1,
                None => {}
            }
        }
        if unresolved > 0 {
            warn!(
                txid = %node.txid,
                unresolved,
                "funding transactions unknown to the node; fee and some input owners stay unknown"
            );
        }
        Ok(())
    }

    // -- spend resolution -----------------------------------------------------

    /// Resolve which input spent `outpoint`.
    ///
    /// Returns `Unspent` when the node still has the output in its UTXO set
    /// and `Unspendable` for OP_RETURN outputs. When the node reports it
    /// spent, the indexer's history for the output's script is scanned;
    /// `NotIndexed` means no indexer is configured or the indexer does not
    /// (yet) know the spender. At most `spend_scan_limit` uncached history
    /// transactions are fetched, in chunks, stopping at the spender;
    /// `SpendScanCapped` reports a search that hit the cap.
    pub async fn get_spending_tx(&self, outpoint: OutPoint) -> Result<SpendStatus, CoreError> {
        let tx = self.get_transaction(&outpoint.txid).await?;
        let output = tx.output(outpoint.vout).ok_or_else(|| {
            CoreError::InvalidInput(format!(
                "vout {} out of range for {} ({} outputs)",
                outpoint.vout,
                outpoint.txid,
                tx.outputs.len()
            ))
        })?;
        if output.script_pub_key.is_op_return() {
            return Ok(SpendStatus::Unspendable);
        }
        if self.is_unspent(outpoint).await? {
            return Ok(SpendStatus::Unspent);
        }

        let Some(indexer) = self.indexer.as_ref() else {
            return Err(CoreError::NotIndexed(outpoint));
        };
        let hash = ScriptHash::from_script(&output.script_pub_key);
        let what = format!("history of {hash}");
        let history = retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            indexer.get_history(&hash).await
        })
        .await?;

        let funded_at = tx.block_height.map(|h| i64::from(h.0));
        let mut uncached = Vec::new();
        for entry in &history {
            if entry.tx_hash == outpoint.txid {
                continue;
            }
            // A confirmed spender is never mined below its funding block.
            if matches!(funded_at, Some(funded) if entry.height > 0 && entry.height < funded) {
                continue;
            }
            match self.cache.get_tx(&entry.tx_hash) {
                Some(candidate) => {
                    if let Some(spend) = find_spend(&candidate, outpoint) {
                        return Ok(SpendStatus::Spent(spend));
                    }
                }
                None => uncached.push(entry.tx_hash),
            }
        }

        let scanned = uncached.len().min(self.spend_scan_limit);
        for chunk in uncached[..scanned].chunks(SPEND_SCAN_CHUNK) {
            let mut spender = None;
            for mut candidate in self.fetch_available(chunk).await? {
                if spender.is_none() {
                    if let Some(spend) = find_spend(&candidate, outpoint) {
                        spender = Some((spend, candidate));
                        continue;
                    }
                }
                self.annotate_outputs(&mut candidate);
                self.cache.insert_outputs_as_prevouts(&candidate);
            }
            if let Some((spend, candidate)) = spender {
                self.complete(candidate).await?;
                return Ok(SpendStatus::Spent(spend));
            }
        }

        if scanned < uncached.len() {
            warn!(%outpoint, scanned, candidates = uncached.len(), "spender search hit its scan cap");
            return Err(CoreError::SpendScanCapped { outpoint, scanned });
        }
        debug!(%outpoint, "node reports spent but indexer history has no spender");
        Err(CoreError::NotIndexed(outpoint))
    }

    // -- address lookups ------------------------------------------------------

    /// Parse an address for the gateway's network and return its script.
    pub fn parse_address(&self, address: &str) -> Result<ScriptBuf, CoreError> {
        let unchecked: Address<NetworkUnchecked> = address
            .trim()
            .parse()
            .map_err(|e| CoreError::InvalidInput(format!("malformed address `{address}`: {e}")))?;
        let checked = unchecked.require_network(self.network).map_err(|e| {
            CoreError::InvalidInput(format!(
                "address `{address}` is not valid for {}: {e}",
                self.network
            ))
        })?;
        Ok(checked.script_pubkey())
    }

    pub async fn get_address_history(&self, address: &str) -> Result<Vec<HistoryEntry>, CoreError> {
        let script = self.parse_address(address)?;
        let indexer = self.indexer("address history")?;
        let hash = ScriptHash::from_script(&script);
        let what = format!("history of {address}");
        retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            indexer.get_history(&hash).await
        })
        .await
    }

    pub async fn get_address_balance(&self, address: &str) -> Result<Balance, CoreError> {
        let script = self.parse_address(address)?;
        let indexer = self.indexer("address balance")?;
        let hash = ScriptHash::from_script(&script);
        let what = format!("balance of {address}");
        retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            indexer.get_balance(&hash).await
        })
        .await
    }

    pub async fn get_address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>, CoreError> {
        let script = self.parse_address(address)?;
        let indexer = self.indexer("address utxo listing")?;
        let hash = ScriptHash::from_script(&script);
        let what = format!("utxos of {address}");
        let entries = retry(&self.retry, &what, || async move {
            let _permit = self.permit().await?;
            indexer.list_unspent(&hash).await
        })
        .await?;

        Ok(entries
            .into_iter()
            .map(|entry| AddressUtxo {
                outpoint: OutPoint::new(entry.tx_hash, entry.tx_pos),
                value: Amount::from_sat(entry.value),
                height: u32::try_from(entry.height)
                    .ok()
                    .filter(|h| *h > 0)
                    .map(BlockHeight),
                address: address.trim().to_owned(),
            })
            .collect())
    }
}

fn apply_prevout(input: &mut crate::types::TxInput, info: PrevoutInfo) {
    input.value = Some(info.value);
    input.script_type = Some(info.script_type);
    input.address = info.address;
    input.script_pub_key = Some(info.script_pub_key);
}

fn find_spend(candidate: &TxNode, outpoint: OutPoint) -> Option<SpendRef> {
    candidate
        .inputs
        .iter()
        .position(|input| input.prevout == Some(outpoint))
        .map(|index| SpendRef {
            txid: candidate.txid,
            input_index: index as u32,
        })
}
