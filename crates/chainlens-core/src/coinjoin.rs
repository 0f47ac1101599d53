//! CoinJoin detection.
//!
//! Classifies a single transaction's mixing likelihood from its output value
//! structure, participant counts and (optionally) how many distinct clusters
//! its inputs come from. Pure and deterministic: the same transaction and
//! cluster state always yield the same analysis.

use std::collections::BTreeMap;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterStore;
use crate::types::TxNode;

// ==============================================================================
// Result Types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinJoinProtocol {
    Whirlpool,
    Wasabi,
    JoinMarket,
    Generic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    WhirlpoolPool,
    WasabiEqualOutputs,
    JoinmarketMakerTaker,
    EqualOutputs,
    EqualOutputsPartial,
    ParticipantCount,
    InputHeterogeneity,
}

impl Heuristic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhirlpoolPool => "whirlpool_pool",
            Self::WasabiEqualOutputs => "wasabi_equal_outputs",
            Self::JoinmarketMakerTaker => "joinmarket_maker_taker",
            Self::EqualOutputs => "equal_outputs",
            Self::EqualOutputsPartial => "equal_outputs_partial",
            Self::ParticipantCount => "participant_count",
            Self::InputHeterogeneity => "input_heterogeneity",
        }
    }

    /// Signature heuristics identify a protocol; the rest only support.
    pub fn is_signature(self) -> bool {
        matches!(
            self,
            Self::WhirlpoolPool
                | Self::WasabiEqualOutputs
                | Self::JoinmarketMakerTaker
                | Self::EqualOutputs
                | Self::EqualOutputsPartial
        )
    }

    pub fn is_weak(self) -> bool {
        matches!(self, Self::EqualOutputsPartial)
    }

    fn protocol(self) -> CoinJoinProtocol {
        match self {
            Self::WhirlpoolPool => CoinJoinProtocol::Whirlpool,
            Self::WasabiEqualOutputs => CoinJoinProtocol::Wasabi,
            Self::JoinmarketMakerTaker => CoinJoinProtocol::JoinMarket,
            Self::EqualOutputs | Self::EqualOutputsPartial => CoinJoinProtocol::Generic,
            Self::ParticipantCount | Self::InputHeterogeneity => CoinJoinProtocol::None,
        }
    }
}

impl std::fmt::Display for Heuristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinJoinAnalysis {
    /// 0 to 100.
    pub score: u8,
    pub protocol: CoinJoinProtocol,
    pub confidence: DetectionConfidence,
    pub matched_heuristics: Vec<Heuristic>,
    /// The repeated output value, when an equal-output heuristic matched.
    pub denomination: Option<Amount>,
    /// How many outputs carry `denomination`.
    pub equal_output_count: usize,
}

impl CoinJoinAnalysis {
    pub fn none() -> Self {
        Self {
            score: 0,
            protocol: CoinJoinProtocol::None,
            confidence: DetectionConfidence::Low,
            matched_heuristics: Vec::new(),
            denomination: None,
            equal_output_count: 0,
        }
    }

    pub fn is_coinjoin(&self, threshold: u8) -> bool {
        self.score >= threshold
    }

    pub fn matched(&self, heuristic: Heuristic) -> bool {
        self.matched_heuristics.contains(&heuristic)
    }
}

// ==============================================================================
// Policy
// ==============================================================================

/// Additive weights per heuristic. The sum is clamped to 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicWeights {
    pub whirlpool_pool: u8,
    pub wasabi_equal_outputs: u8,
    pub joinmarket_maker_taker: u8,
    pub equal_outputs: u8,
    pub equal_outputs_partial: u8,
    pub participant_count: u8,
    pub input_heterogeneity: u8,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            whirlpool_pool: 60,
            wasabi_equal_outputs: 55,
            joinmarket_maker_taker: 45,
            equal_outputs: 40,
            equal_outputs_partial: 20,
            participant_count: 20,
            input_heterogeneity: 15,
        }
    }
}

impl HeuristicWeights {
    pub fn weight(&self, heuristic: Heuristic) -> u8 {
        match heuristic {
            Heuristic::WhirlpoolPool => self.whirlpool_pool,
            Heuristic::WasabiEqualOutputs => self.wasabi_equal_outputs,
            Heuristic::JoinmarketMakerTaker => self.joinmarket_maker_taker,
            Heuristic::EqualOutputs => self.equal_outputs,
            Heuristic::EqualOutputsPartial => self.equal_outputs_partial,
            Heuristic::ParticipantCount => self.participant_count,
            Heuristic::InputHeterogeneity => self.input_heterogeneity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorPolicy {
    /// Score at or above which a transaction counts as a CoinJoin.
    pub threshold: u8,
    pub weights: HeuristicWeights,
    /// Whirlpool pool denominations in satoshis.
    pub whirlpool_denominations: Vec<u64>,
    pub whirlpool_tolerance_sats: u64,
    pub whirlpool_participants: usize,
    pub wasabi_min_equal_outputs: usize,
    pub equal_outputs_min: usize,
    pub partial_equal_outputs_min: usize,
    pub participant_min: usize,
    /// Accepted input/output count ratio for the participant heuristic.
    pub participant_ratio: (f64, f64),
    pub heterogeneity_min_clusters: usize,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            threshold: 50,
            weights: HeuristicWeights::default(),
            whirlpool_denominations: vec![100_000, 1_000_000, 5_000_000, 50_000_000],
            whirlpool_tolerance_sats: 10_000,
            whirlpool_participants: 5,
            wasabi_min_equal_outputs: 10,
            equal_outputs_min: 5,
            partial_equal_outputs_min: 3,
            participant_min: 5,
            participant_ratio: (0.5, 2.0),
            heterogeneity_min_clusters: 3,
        }
    }
}

// ==============================================================================
// Detector
// ==============================================================================

#[derive(Debug, Clone, Default)]
pub struct CoinJoinDetector {
    policy: DetectorPolicy,
}

impl CoinJoinDetector {
    pub fn new(policy: DetectorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    pub fn threshold(&self) -> u8 {
        self.policy.threshold
    }

    /// Classify `tx`. `clusters` enables the input-heterogeneity heuristic.
    pub fn classify(&self, tx: &TxNode, clusters: Option<&ClusterStore>) -> CoinJoinAnalysis {
        if tx.is_coinbase() || tx.outputs.is_empty() {
            return CoinJoinAnalysis::none();
        }

        let policy = &self.policy;
        let inputs = tx.inputs.len();
        let outputs = tx.outputs.len();
        let (denomination, equal_count) = most_common_value(tx);
        let mut matched = Vec::new();

        // Equal-output signatures are mutually exclusive, most specific first.
        if let Some(signature) = self.equal_output_signature(tx, denomination, equal_count) {
            matched.push(signature);
        }

        if inputs >= policy.participant_min && outputs >= policy.participant_min {
            let ratio = inputs as f64 / outputs as f64;
            if ratio >= policy.participant_ratio.0 && ratio <= policy.participant_ratio.1 {
                matched.push(Heuristic::ParticipantCount);
            }
        }

        if let Some(clusters) = clusters {
            let addresses = tx.input_addresses();
            let distinct = clusters.distinct_clusters(&addresses);
            if distinct >= policy.heterogeneity_min_clusters && distinct * 2 >= addresses.len() {
                matched.push(Heuristic::InputHeterogeneity);
            }
        }

        if matched.is_empty() {
            return CoinJoinAnalysis::none();
        }

        let score = matched
            .iter()
            .map(|h| u32::from(policy.weights.weight(*h)))
            .sum::<u32>()
            .min(100) as u8;

        let protocol = matched
            .iter()
            .copied()
            .filter(|h| h.is_signature())
            .max_by_key(|h| policy.weights.weight(*h))
            .map_or(CoinJoinProtocol::None, Heuristic::protocol);

        let has_signature = matched.iter().any(|h| h.is_signature());
        let confidence = if matched.len() >= 2 && has_signature {
            DetectionConfidence::High
        } else if matched.iter().any(|h| !h.is_weak()) {
            DetectionConfidence::Medium
        } else {
            DetectionConfidence::Low
        };

        let equal_based = matched.iter().any(|h| h.is_signature());
        CoinJoinAnalysis {
            score,
            protocol,
            confidence,
            matched_heuristics: matched,
            denomination: equal_based.then_some(denomination),
            equal_output_count: if equal_based { equal_count } else { 0 },
        }
    }

    fn equal_output_signature(
        &self,
        tx: &TxNode,
        denomination: Amount,
        equal_count: usize,
    ) -> Option<Heuristic> {
        let policy = &self.policy;
        let inputs = tx.inputs.len();
        let outputs = tx.outputs.len();
        let value = denomination.to_sat();

        let is_pool_denomination = policy
            .whirlpool_denominations
            .iter()
            .any(|d| value.abs_diff(*d) <= policy.whirlpool_tolerance_sats);
        if is_pool_denomination
            && equal_count == policy.whirlpool_participants
            && outputs == policy.whirlpool_participants
            && inputs == policy.whirlpool_participants
        {
            return Some(Heuristic::WhirlpoolPool);
        }

        if equal_count >= policy.wasabi_min_equal_outputs && inputs >= policy.participant_min {
            return Some(Heuristic::WasabiEqualOutputs);
        }

        // Makers receive the equal amount plus change; the taker usually
        // leaves one change output less than there are equal outputs.
        let change = outputs - equal_count;
        if equal_count >= policy.partial_equal_outputs_min
            && change + 1 >= equal_count
            && change <= equal_count
            && inputs >= equal_count
        {
            return Some(Heuristic::JoinmarketMakerTaker);
        }

        if equal_count >= policy.equal_outputs_min && inputs >= 2 {
            return Some(Heuristic::EqualOutputs);
        }

        if equal_count >= policy.partial_equal_outputs_min && inputs >= 2 {
            return Some(Heuristic::EqualOutputsPartial);
        }

        None
    }
}

/// The most repeated non-zero output value and its count. Ties go to the
/// larger value so results do not depend on output order.
fn most_common_value(tx: &TxNode) -> (Amount, usize) {
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for output in &tx.outputs {
        if output.value > Amount::ZERO && !output.script_pub_key.is_op_return() {
            *counts.entry(output.value.to_sat()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then(va.cmp(vb)))
        .map_or((Amount::ZERO, 0), |(v, c)| (Amount::from_sat(v), c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    fn detector() -> CoinJoinDetector {
        CoinJoinDetector::default()
    }

    #[test]
    fn whirlpool_shape_is_detected_with_high_confidence() {
        let tx = whirlpool_tx(txid_from_byte(1), 0x10);
        let analysis = detector().classify(&tx, None);
        assert_eq!(analysis.protocol, CoinJoinProtocol::Whirlpool);
        assert_eq!(analysis.confidence, DetectionConfidence::High);
        assert!(analysis.matched(Heuristic::WhirlpoolPool));
        assert!(analysis.matched(Heuristic::ParticipantCount));
        assert_eq!(analysis.score, 80);
        assert_eq!(analysis.denomination, Some(Amount::from_sat(1_000_000)));
        assert!(analysis.is_coinjoin(detector().threshold()));
    }

    #[test]
    fn heterogeneous_inputs_add_weight() {
        let tx = whirlpool_tx(txid_from_byte(1), 0x10);
        let clusters = ClusterStore::new();
        let analysis = detector().classify(&tx, Some(&clusters));
        assert!(analysis.matched(Heuristic::InputHeterogeneity));
        assert_eq!(analysis.score, 95);
    }

    #[test]
    fn classification_is_deterministic() {
        let tx = whirlpool_tx(txid_from_byte(1), 0x10);
        let first = detector().classify(&tx, None);
        for _ in 0..10 {
            assert_eq!(detector().classify(&tx, None), first);
        }
    }

    #[test]
    fn simple_payment_scores_zero() {
        let tx = make_raw_tx(
            txid_from_byte(2),
            vec![owned_input(txid_from_byte(9), 0, 1, 100_000)],
            vec![owned_output(60_000, 2), owned_output(39_000, 1)],
        );
        let analysis = detector().classify(&tx, None);
        assert_eq!(analysis, CoinJoinAnalysis::none());
        assert_eq!(analysis.protocol, CoinJoinProtocol::None);
    }

    #[test]
    fn wasabi_style_many_equal_outputs() {
        let inputs = (0..12u8)
            .map(|i| owned_input(txid_from_byte(0x80 + i), 0, 0x20 + i, 2_000_000))
            .collect();
        let mut outputs: Vec<_> = (0..12u8).map(|i| owned_output(1_234_567, 0x40 + i)).collect();
        outputs.push(owned_output(700_000, 0x70));
        let tx = make_raw_tx(txid_from_byte(3), inputs, outputs);
        let analysis = detector().classify(&tx, None);
        assert_eq!(analysis.protocol, CoinJoinProtocol::Wasabi);
        assert_eq!(analysis.equal_output_count, 12);
        assert_eq!(analysis.score, 75);
    }

    #[test]
    fn joinmarket_equal_outputs_with_change() {
        let inputs = (0..4u8)
            .map(|i| owned_input(txid_from_byte(0x90 + i), 0, 0x20 + i, 3_000_000))
            .collect();
        let outputs = vec![
            owned_output(2_500_000, 0x40),
            owned_output(2_500_000, 0x41),
            owned_output(2_500_000, 0x42),
            owned_output(412_345, 0x43),
            owned_output(498_765, 0x44),
        ];
        let tx = make_raw_tx(txid_from_byte(4), inputs, outputs);
        let analysis = detector().classify(&tx, None);
        assert_eq!(analysis.protocol, CoinJoinProtocol::JoinMarket);
        assert_eq!(analysis.confidence, DetectionConfidence::Medium);
        assert!(!analysis.is_coinjoin(50));
    }

    #[test]
    fn partial_match_alone_is_low_confidence() {
        let tx = make_raw_tx(
            txid_from_byte(5),
            vec![
                owned_input(txid_from_byte(0xA0), 0, 1, 500_000),
                owned_input(txid_from_byte(0xA1), 0, 2, 500_000),
            ],
            vec![
                owned_output(300_000, 3),
                owned_output(300_000, 4),
                owned_output(300_000, 5),
                owned_output(10_000, 6),
                owned_output(11_000, 7),
                owned_output(12_000, 8),
                owned_output(13_000, 9),
            ],
        );
        let analysis = detector().classify(&tx, None);
        assert_eq!(analysis.matched_heuristics, vec![Heuristic::EqualOutputsPartial]);
        assert_eq!(analysis.confidence, DetectionConfidence::Low);
        assert_eq!(analysis.protocol, CoinJoinProtocol::Generic);
    }

    #[test]
    fn coinbase_is_never_a_coinjoin() {
        let tx = make_raw_tx(
            txid_from_byte(6),
            vec![coinbase_input()],
            vec![owned_output(1_000_000, 1); 5],
        );
        assert_eq!(detector().classify(&tx, None).score, 0);
    }
}
