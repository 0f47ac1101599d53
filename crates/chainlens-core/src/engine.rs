//! The analysis engine: one entry point per public operation.
//!
//! `Engine` owns the process-wide state (gateway cache, cluster store,
//! entity registry) and hands out short-lived tracers per request. Every
//! depth parameter is validated before any upstream call.

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::{Amount, OutPoint, Txid};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::cluster::{ClusterId, ClusterInfo, ClusterStore, MergeOutcome};
use crate::coinjoin::{CoinJoinAnalysis, CoinJoinDetector};
use crate::config::EngineConfig;
use crate::enrich::{tx_facts, TxFacts};
use crate::entities::EntityRegistry;
use crate::error::CoreError;
use crate::exposure::{ExposureError, ExposureReport, ExposureSimulator};
use crate::gateway::ChainGateway;
use crate::indexer::Balance;
use crate::privacy::{score_utxo, PrivacyScore, UtxoSignals};
use crate::tracer::{TraceError, TraceTree, Tracer, UtxoTree};
use crate::types::{validate_depth, BlockHeight, Direction};

// ==============================================================================
// Results
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyReport {
    pub txid: Txid,
    pub analysis: CoinJoinAnalysis,
    pub facts: TxFacts,
    /// What CIOH did with the inputs after classification.
    pub cluster_merge: MergeOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReport {
    pub address: String,
    pub cluster: ClusterInfo,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoReport {
    pub outpoint: OutPoint,
    pub address: Option<String>,
    pub value: Amount,
    pub unspent: bool,
    pub signals: UtxoSignals,
    pub privacy: PrivacyScore,
    /// Nodes in the backward history used for the signals.
    pub history_nodes: usize,
    pub warnings: Vec<String>,
}

/// Bulk scoring stopped early; `partial` holds the UTXOs already scored.
#[derive(Debug, thiserror::Error)]
#[error("scoring stopped after {} utxo(s): {source}", .partial.len())]
pub struct BulkScoreError {
    pub partial: Vec<UtxoReport>,
    #[source]
    pub source: CoreError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DustUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub height: Option<BlockHeight>,
    /// Below the relay dust limit: almost certainly unsolicited.
    pub likely_attack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DustReport {
    pub address: String,
    pub threshold_sats: u64,
    pub utxos: Vec<DustUtxo>,
    pub total_dust_sats: u64,
    pub likely_attack_count: usize,
    /// Whole balance of the address, dust included.
    pub balance: Balance,
}

// ==============================================================================
// Engine
// ==============================================================================

pub struct Engine {
    gateway: Arc<ChainGateway>,
    detector: CoinJoinDetector,
    clusters: Arc<ClusterStore>,
    entities: Arc<EntityRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(gateway: ChainGateway, config: EngineConfig) -> Self {
        Self {
            gateway: Arc::new(gateway),
            detector: CoinJoinDetector::new(config.detector.clone()),
            clusters: Arc::new(ClusterStore::new()),
            entities: Arc::new(EntityRegistry::new()),
            config,
        }
    }

    /// Share an existing (possibly hydrated) cluster store.
    pub fn with_clusters(mut self, clusters: Arc<ClusterStore>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn with_entities(mut self, entities: EntityRegistry) -> Self {
        self.entities = Arc::new(entities);
        self
    }

    pub fn gateway(&self) -> &ChainGateway {
        &self.gateway
    }

    pub fn clusters(&self) -> &ClusterStore {
        &self.clusters
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn tracer(&self) -> Tracer<'_> {
        Tracer::new(&self.gateway, &self.detector, &self.clusters)
    }

    // -- classification and clustering ---------------------------------------

    /// Classify one transaction, then feed its inputs to CIOH unless it
    /// looks like a CoinJoin.
    pub async fn classify(&self, txid: Txid) -> Result<ClassifyReport, CoreError> {
        let tx = self.gateway.get_transaction(&txid).await?;
        let analysis = self.detector.classify(&tx, Some(self.clusters.as_ref()));
        let cluster_merge =
            self.clusters
                .merge_transaction(&tx, &analysis, self.detector.threshold());
        debug!(%txid, score = analysis.score, protocol = ?analysis.protocol, "classified");
        Ok(ClassifyReport {
            txid,
            facts: tx_facts(&tx),
            analysis,
            cluster_merge,
        })
    }

    /// Union `addresses` into one cluster after validating each of them.
    pub fn merge(&self, addresses: &[String]) -> Result<Option<ClusterId>, CoreError> {
        for address in addresses {
            self.gateway.parse_address(address)?;
        }
        Ok(self.clusters.merge(addresses))
    }

    pub fn find(&self, address: &str) -> Result<ClusterId, CoreError> {
        self.gateway.parse_address(address)?;
        Ok(self.clusters.find(address.trim()))
    }

    pub fn cluster_of(&self, address: &str) -> Result<ClusterReport, CoreError> {
        self.gateway.parse_address(address)?;
        let address = address.trim();
        Ok(ClusterReport {
            address: address.to_owned(),
            cluster: self.clusters.cluster_of(address),
            members: self.clusters.members(address),
        })
    }

    // -- tracing --------------------------------------------------------------

    pub async fn trace(
        &self,
        origin: OutPoint,
        direction: Direction,
        max_depth: u32,
        cancel: &Cancellation,
    ) -> Result<TraceTree, TraceError> {
        self.tracer()
            .trace(origin, direction, max_depth, &self.config.trace, cancel)
            .await
    }

    pub async fn utxo_tree(
        &self,
        txid: Txid,
        forward_depth: u32,
        backward_depth: u32,
        cancel: &Cancellation,
    ) -> Result<UtxoTree, TraceError> {
        self.tracer()
            .utxo_tree(txid, forward_depth, backward_depth, &self.config.trace, cancel)
            .await
    }

    // -- scoring --------------------------------------------------------------

    /// Gather privacy signals for one output and score it. The backward
    /// history is traced `history_depth` hops deep.
    pub async fn score_utxo(
        &self,
        outpoint: OutPoint,
        history_depth: u32,
        cancel: &Cancellation,
    ) -> Result<UtxoReport, CoreError> {
        validate_depth(history_depth)?;
        let tx = self.gateway.get_transaction(&outpoint.txid).await?;
        let output = tx.output(outpoint.vout).ok_or_else(|| {
            CoreError::InvalidInput(format!(
                "vout {} out of range for {} ({} outputs)",
                outpoint.vout,
                outpoint.txid,
                tx.outputs.len()
            ))
        })?;

        let tree = self
            .tracer()
            .trace(
                outpoint,
                Direction::Backward,
                history_depth,
                &self.config.trace,
                cancel,
            )
            .await
            .map_err(|e| e.source)?;
        let mut warnings = tree.warnings.clone();

        let address = output.address.clone();
        let address_reused = match address.as_deref() {
            Some(address) => self.address_reused(address, &tree, &mut warnings).await?,
            None => false,
        };
        let cluster_size = address
            .as_deref()
            .map_or(1, |a| self.clusters.cluster_size_of(a));
        let tip = self.gateway.tip_height().await?;
        let (entity_distance, entity_name) = self.nearest_entity(&tree);

        let signals = UtxoSignals {
            value: output.value,
            cluster_size,
            coinjoin_passes: tree.max_crossings(),
            address_reused,
            created_by_coinjoin: tree.root().is_some_and(|r| r.coinjoin_crossing),
            confirmations: tx.confirmations(tip),
            entity_distance,
            entity_name,
        };
        let privacy = score_utxo(&signals, &self.config.privacy);
        let unspent = self.gateway.is_unspent(outpoint).await?;
        debug!(%outpoint, score = privacy.score, "utxo scored");

        Ok(UtxoReport {
            outpoint,
            address,
            value: output.value,
            unspent,
            signals,
            privacy,
            history_nodes: tree.nodes.len(),
            warnings,
        })
    }

    /// Reuse from indexer history when available, otherwise from what the
    /// trace itself observed.
    async fn address_reused(
        &self,
        address: &str,
        tree: &TraceTree,
        warnings: &mut Vec<String>,
    ) -> Result<bool, CoreError> {
        if !self.gateway.indexer_enabled() {
            return Ok(tree.graph().receipts_to(address) > 1);
        }
        let history = self.gateway.get_address_history(address).await?;
        if history.len() > self.config.reuse_scan_limit {
            warnings.push(format!(
                "address history has {} entries; reuse checked on the first {}",
                history.len(),
                self.config.reuse_scan_limit
            ));
        }
        let mut receipts = 0;
        for entry in history.iter().take(self.config.reuse_scan_limit) {
            let tx = self.gateway.get_transaction(&entry.tx_hash).await?;
            if tx
                .outputs
                .iter()
                .any(|o| o.address.as_deref() == Some(address))
            {
                receipts += 1;
                if receipts > 1 {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Depth of the first backward node attributed to a known entity.
    fn nearest_entity(&self, tree: &TraceTree) -> (Option<u32>, Option<String>) {
        for node in &tree.nodes {
            let entity = node
                .address
                .as_deref()
                .and_then(|a| self.entities.lookup_address(a))
                .or_else(|| self.entities.lookup_tx(&node.outpoint.txid));
            if let Some(entity) = entity {
                return (Some(node.depth), Some(entity.name.clone()));
            }
        }
        (None, None)
    }

    /// Score every UTXO held by `address`, a few at a time, in indexer
    /// order. Stops at the first failure or cancellation and returns what
    /// was scored so far.
    pub async fn score_address_utxos(
        &self,
        address: &str,
        history_depth: u32,
        cancel: &Cancellation,
    ) -> Result<Vec<UtxoReport>, BulkScoreError> {
        let fail = |source| BulkScoreError {
            partial: Vec::new(),
            source,
        };
        validate_depth(history_depth).map_err(fail)?;
        let utxos = self.gateway.get_address_utxos(address).await.map_err(fail)?;
        info!(address, utxos = utxos.len(), "scoring address utxos");

        let mut scored = stream::iter(utxos.iter())
            .map(|utxo| self.score_utxo(utxo.outpoint, history_depth, cancel))
            .buffered(self.config.bulk_concurrency.max(1));

        let mut reports = Vec::with_capacity(utxos.len());
        while let Some(result) = scored.next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(source) => {
                    warn!(address, scored = reports.len(), error = %source, "bulk scoring stopped");
                    return Err(BulkScoreError {
                        partial: reports,
                        source,
                    });
                }
            }
        }
        Ok(reports)
    }

    // -- exposure -------------------------------------------------------------

    pub async fn simulate_exposure(
        &self,
        withdrawal_txid: Txid,
        withdrawal_address: &str,
        max_depth: u32,
        cancel: &Cancellation,
    ) -> Result<ExposureReport, ExposureError> {
        ExposureSimulator::new(
            self.tracer(),
            &self.gateway,
            &self.entities,
            &self.config.exposure,
        )
        .simulate(
            withdrawal_txid,
            withdrawal_address,
            max_depth,
            &self.config.trace,
            cancel,
        )
        .await
    }

    /// UTXOs of `address` at or below `threshold_sats` (the configured dust
    /// threshold when `None`). Requires an indexer.
    pub async fn scan_dust(
        &self,
        address: &str,
        threshold_sats: Option<u64>,
    ) -> Result<DustReport, CoreError> {
        let threshold_sats = threshold_sats.unwrap_or(self.config.dust.threshold_sats);
        let (utxos, balance) = futures::try_join!(
            self.gateway.get_address_utxos(address),
            self.gateway.get_address_balance(address),
        )?;

        let mut seen = HashSet::new();
        let mut dust: Vec<DustUtxo> = utxos
            .into_iter()
            .filter(|u| u.value.to_sat() <= threshold_sats && seen.insert(u.outpoint))
            .map(|u| DustUtxo {
                outpoint: u.outpoint,
                value: u.value,
                height: u.height,
                likely_attack: u.value.to_sat() < self.config.dust.attack_below_sats,
            })
            .collect();
        dust.sort_by_key(|d| (d.value, d.outpoint));

        Ok(DustReport {
            address: address.trim().to_owned(),
            threshold_sats,
            total_dust_sats: dust.iter().map(|d| d.value.to_sat()).sum(),
            likely_attack_count: dust.iter().filter(|d| d.likely_attack).count(),
            utxos: dust,
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Entity, EntityKind};
    use crate::gateway::tests::gateway_for;
    use crate::test_util::*;
    use crate::types::TxNode;

    const EXCHANGE: u8 = 0x01;
    const USER: u8 = 0x09;

    fn engine(txs: Vec<TxNode>, indexed: bool) -> Engine {
        Engine::new(gateway_for(txs, indexed), EngineConfig::default())
    }

    /// Exchange -> user withdrawal, then the user pays three dust-sized
    /// outputs to USER's second address (0x0A).
    fn history() -> Vec<TxNode> {
        let funding = make_raw_tx(
            txid_from_byte(0x50),
            vec![coinbase_input()],
            vec![owned_output(10_000_000, EXCHANGE)],
        );
        let withdrawal = make_raw_tx(
            txid_from_byte(0x51),
            vec![owned_input(funding.txid, 0, EXCHANGE, 10_000_000)],
            vec![owned_output(1_234_567, USER), owned_output(8_760_000, EXCHANGE)],
        );
        let dusting = make_raw_tx(
            txid_from_byte(0x52),
            vec![owned_input(txid_from_byte(0x5F), 0, 0x30, 50_000)],
            vec![
                owned_output(300, 0x0A),
                owned_output(800, 0x0A),
                owned_output(40_000, 0x0A),
            ],
        );
        vec![funding, withdrawal, dusting]
    }

    #[tokio::test]
    async fn classify_merges_ordinary_inputs() {
        let funding = (1..=2u8).map(|owner| {
            make_raw_tx(
                txid_from_byte(0x20 + owner),
                vec![coinbase_input()],
                vec![owned_output(50_000, owner)],
            )
        });
        let spend = make_raw_tx(
            txid_from_byte(0x20),
            vec![
                spending_input(txid_from_byte(0x21), 0),
                spending_input(txid_from_byte(0x22), 0),
            ],
            vec![owned_output(99_000, 3)],
        );
        let engine = engine(funding.chain([spend]).collect(), false);
        let report = engine.classify(txid_from_byte(0x20)).await.unwrap();

        assert_eq!(report.analysis.score, 0);
        assert_eq!(report.facts.fee_sats, Some(1_000));
        assert!(matches!(
            report.cluster_merge,
            MergeOutcome::Merged { addresses: 2, .. }
        ));
        assert_eq!(
            engine.find(&owner_address(1)).unwrap(),
            engine.find(&owner_address(2)).unwrap()
        );
    }

    #[tokio::test]
    async fn classify_unknown_funding_has_nothing_to_merge() {
        let tx = make_raw_tx(
            txid_from_byte(0x28),
            vec![
                spending_input(txid_from_byte(0x29), 0),
                spending_input(txid_from_byte(0x2A), 0),
            ],
            vec![owned_output(99_000, 3)],
        );
        let report = engine(vec![tx], false)
            .classify(txid_from_byte(0x28))
            .await
            .unwrap();
        assert_eq!(report.cluster_merge, MergeOutcome::NothingToMerge);
        assert_eq!(report.facts.fee_sats, None);
    }

    #[tokio::test]
    async fn classify_skips_merge_for_coinjoins() {
        let mix = whirlpool_tx(txid_from_byte(0x30), 0x10);
        let engine = engine(vec![mix], false);
        let report = engine.classify(txid_from_byte(0x30)).await.unwrap();
        assert!(report.analysis.is_coinjoin(engine.config().detector.threshold));
        assert_eq!(report.cluster_merge, MergeOutcome::SkippedCoinJoin);
    }

    #[test]
    fn cluster_operations_validate_addresses() {
        let engine = engine(Vec::new(), false);
        let a = owner_address(1);
        let b = owner_address(2);
        engine.merge(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(engine.find(&a).unwrap(), engine.find(&b).unwrap());
        assert_eq!(engine.cluster_of(&a).unwrap().members.len(), 2);
        assert!(matches!(
            engine.find("definitely-not-an-address"),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn score_utxo_reports_entity_proximity() {
        let mut entities = EntityRegistry::new();
        entities.insert_address(
            owner_address(EXCHANGE),
            Entity {
                name: "Example Exchange".into(),
                kind: EntityKind::Exchange,
                source: "exchanges/example".into(),
            },
        );
        let engine = engine(history(), true).with_entities(entities);
        let report = engine
            .score_utxo(OutPoint::new(txid_from_byte(0x51), 0), 6, &Cancellation::new())
            .await
            .unwrap();

        assert!(report.unspent);
        assert_eq!(report.signals.entity_distance, Some(1));
        assert_eq!(report.signals.entity_name.as_deref(), Some("Example Exchange"));
        assert_eq!(report.signals.coinjoin_passes, 0);
        assert!(!report.signals.address_reused);
        // 50 baseline, -20 for one hop from an exchange.
        assert_eq!(report.privacy.score, 30);
    }

    #[tokio::test]
    async fn score_utxo_rejects_bad_vout_and_depth() {
        let engine = engine(history(), true);
        let err = engine
            .score_utxo(OutPoint::new(txid_from_byte(0x51), 7), 6, &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        let err = engine
            .score_utxo(OutPoint::new(txid_from_byte(0x51), 0), 51, &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn score_address_utxos_scores_each_utxo() {
        let engine = engine(history(), true);
        let reports = engine
            .score_address_utxos(&owner_address(0x0A), 2, &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        // Three receipts in one transaction count as a single receipt.
        assert!(reports.iter().all(|r| !r.signals.address_reused));
        assert_eq!(reports.iter().filter(|r| r.privacy.dust_warning).count(), 2);
    }

    #[tokio::test]
    async fn cancelled_bulk_scoring_returns_partial_list() {
        let engine = engine(history(), true);
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = engine
            .score_address_utxos(&owner_address(0x0A), 2, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.source, CoreError::Cancelled(_)));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn dust_scan_flags_sub_relay_outputs() {
        let engine = engine(history(), true);
        let report = engine.scan_dust(&owner_address(0x0A), None).await.unwrap();
        assert_eq!(report.utxos.len(), 2);
        assert_eq!(report.total_dust_sats, 1_100);
        assert_eq!(report.likely_attack_count, 1);
        assert!(report.utxos[0].likely_attack);
        assert_eq!(report.utxos[0].value, Amount::from_sat(300));
        assert_eq!(report.balance.confirmed, 41_100);
        assert_eq!(report.balance.unconfirmed, 0);

        let err = self::engine(history(), false)
            .scan_dust(&owner_address(0x0A), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IndexerRequired(_)));
    }

    #[tokio::test]
    async fn exposure_runs_through_the_engine() {
        let engine = engine(history(), true);
        let report = engine
            .simulate_exposure(
                txid_from_byte(0x51),
                &owner_address(USER),
                6,
                &Cancellation::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.origin, OutPoint::new(txid_from_byte(0x51), 0));
        assert_eq!(report.score, 15);
    }
}
