//! KYC exposure simulation.
//!
//! Models what an exchange that knows a withdrawal could learn by following
//! the coins forward. The withdrawal output is traced forward until paths
//! cross two CoinJoins, and every leaf of the trace becomes a
//! [`Destination`] with a confidence that the exchange can still link it.
//! The overall score is 100 minus the value-weighted linkability.

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::enrich::is_round_value;
use crate::entities::{Entity, EntityRegistry};
use crate::error::CoreError;
use crate::gateway::ChainGateway;
use crate::tracer::{CoinJoinStop, NodeStatus, TraceError, TraceNode, TraceOptions, TraceTree, Tracer};
use crate::types::{validate_depth, Direction, TxNode};

// ==============================================================================
// Policy
// ==============================================================================

/// Confidence multiplier for paths of at most `max_hops` transactions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HopFactor {
    pub max_hops: u32,
    pub factor: f64,
}

/// Weights of the change-output heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangePolicy {
    /// Output pays back to one of the input addresses.
    pub address_reuse: f64,
    /// Output script type matches every input.
    pub same_script_type: f64,
    pub non_round_value: f64,
    pub round_unit_sats: u64,
    /// Output is smaller than the largest output.
    pub smaller_than_max: f64,
    pub last_position: f64,
    pub threshold: f64,
    pub cap: f64,
}

impl Default for ChangePolicy {
    fn default() -> Self {
        Self {
            address_reuse: 0.4,
            same_script_type: 0.1,
            non_round_value: 0.15,
            round_unit_sats: 100_000,
            smaller_than_max: 0.1,
            last_position: 0.05,
            threshold: 0.3,
            cap: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposurePolicy {
    /// Ordered by `max_hops`; paths longer than every tier use `distant_factor`.
    pub hop_factors: Vec<HopFactor>,
    pub distant_factor: f64,
    /// Multiplier per hop through a transaction with several spendable
    /// outputs, unless the followed output looks like change.
    pub fork_factor: f64,
    pub fork_floor: f64,
    /// Multiplier for a path with exactly one CoinJoin.
    pub coinjoin_factor: f64,
    /// Crossings at which a trail goes cold and tracing stops.
    pub cold_crossings: u32,
    pub high_min: f64,
    pub high_max_hops: u32,
    pub medium_min: f64,
    pub low_min: f64,
    /// Weight of the value-weighted confidence in the overall score.
    pub score_scale: f64,
    /// Score below which the "low score" recommendation fires.
    pub recommend_below: u8,
    pub change: ChangePolicy,
}

impl Default for ExposurePolicy {
    fn default() -> Self {
        Self {
            hop_factors: vec![
                HopFactor {
                    max_hops: 2,
                    factor: 1.0,
                },
                HopFactor {
                    max_hops: 4,
                    factor: 0.65,
                },
                HopFactor {
                    max_hops: 8,
                    factor: 0.45,
                },
                HopFactor {
                    max_hops: 15,
                    factor: 0.3,
                },
            ],
            distant_factor: 0.15,
            fork_factor: 0.9,
            fork_floor: 0.5,
            coinjoin_factor: 0.4,
            cold_crossings: 2,
            high_min: 0.7,
            high_max_hops: 2,
            medium_min: 0.4,
            low_min: 0.2,
            score_scale: 85.0,
            recommend_below: 60,
            change: ChangePolicy::default(),
        }
    }
}

impl ExposurePolicy {
    fn hop_factor(&self, hops: u32) -> f64 {
        self.hop_factors
            .iter()
            .find(|tier| hops <= tier.max_hops)
            .map_or(self.distant_factor, |tier| tier.factor)
    }

    fn band(&self, score: f64, hops: u32, coinjoins: u32) -> ExposureConfidence {
        if score >= self.high_min && hops <= self.high_max_hops && coinjoins == 0 {
            ExposureConfidence::High
        } else if score >= self.medium_min {
            ExposureConfidence::Medium
        } else if score >= self.low_min {
            ExposureConfidence::Low
        } else {
            ExposureConfidence::Negligible
        }
    }
}

/// Named trace depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthPreset {
    Quick,
    Standard,
    Deep,
    Thorough,
}

impl DepthPreset {
    pub fn depth(self) -> u32 {
        match self {
            Self::Quick => 3,
            Self::Standard => 6,
            Self::Deep => 10,
            Self::Thorough => 15,
        }
    }
}

impl std::str::FromStr for DepthPreset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            "thorough" => Ok(Self::Thorough),
            other => Err(CoreError::InvalidInput(format!(
                "unknown depth preset `{other}`; expected quick, standard, deep or thorough"
            ))),
        }
    }
}

// ==============================================================================
// Report Types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureConfidence {
    Negligible,
    Low,
    Medium,
    High,
}

/// How a destination's trail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailStatus {
    /// Coins are still sitting there.
    Unspent,
    /// Two or more CoinJoins crossed; the trail is considered lost to the
    /// exchange.
    Cold,
    DepthLimit,
    /// The next hop could not be observed.
    Lost,
    /// Burned in an OP_RETURN.
    DeadEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureRating {
    Excellent,
    Good,
    Moderate,
    Poor,
    VeryPoor,
}

impl ExposureRating {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Excellent,
            60..=79 => Self::Good,
            40..=59 => Self::Moderate,
            20..=39 => Self::Poor,
            _ => Self::VeryPoor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub outpoint: OutPoint,
    pub address: Option<String>,
    pub value: Option<Amount>,
    /// Fraction of the traced value that ended here.
    pub value_share: f64,
    /// Transactions between the exchange and this output, the withdrawal
    /// included.
    pub hops: u32,
    pub coinjoins: u32,
    /// Hops through a fork that did not follow likely change.
    pub forks: u32,
    pub confidence_score: f64,
    pub confidence: ExposureConfidence,
    pub trail: TrailStatus,
    pub entity: Option<Entity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    UseCoinjoin,
    HighConfidenceDestinations,
    LowScore,
    IndexerMissing,
    AddressReuse,
    LooksGood,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureReport {
    pub withdrawal_txid: Txid,
    pub withdrawal_address: String,
    pub origin: OutPoint,
    pub max_depth: u32,
    pub score: u8,
    pub rating: ExposureRating,
    pub summary: String,
    pub destinations: Vec<Destination>,
    /// Value at High or Medium confidence destinations.
    pub traced_sats: u64,
    pub untraceable_sats: u64,
    pub coinjoins_on_paths: usize,
    pub trace_nodes: usize,
    pub truncated: bool,
    pub recommendations: Vec<Recommendation>,
    pub warnings: Vec<String>,
}

/// A simulation that could not finish; `partial` is the report built from
/// whatever the trace reached.
#[derive(Debug, thiserror::Error)]
#[error("exposure simulation failed: {source}")]
pub struct ExposureError {
    pub partial: Option<Box<ExposureReport>>,
    #[source]
    pub source: CoreError,
}

impl From<CoreError> for ExposureError {
    fn from(source: CoreError) -> Self {
        Self {
            partial: None,
            source,
        }
    }
}

// ==============================================================================
// Change Detection
// ==============================================================================

/// Likelihood in `0..=cap` that output `vout` of `tx` is the sender's
/// change. Single-output transactions have no change.
pub fn change_probability(tx: &TxNode, vout: u32, policy: &ChangePolicy) -> f64 {
    let Some(output) = tx.output(vout) else {
        return 0.0;
    };
    if tx.outputs.len() < 2 {
        return 0.0;
    }

    let mut p = 0.0;
    if let Some(address) = output.address.as_deref() {
        if tx.input_addresses().contains(&address) {
            p += policy.address_reuse;
        }
    }
    let input_types: Vec<_> = tx.inputs.iter().filter_map(|i| i.script_type).collect();
    if !input_types.is_empty() && input_types.iter().all(|t| *t == output.script_type) {
        p += policy.same_script_type;
    }
    if !is_round_value(output.value, policy.round_unit_sats) {
        p += policy.non_round_value;
    }
    let largest = tx.outputs.iter().map(|o| o.value).max().unwrap_or(Amount::ZERO);
    if output.value < largest {
        p += policy.smaller_than_max;
    }
    if vout as usize == tx.outputs.len() - 1 {
        p += policy.last_position;
    }
    p.min(policy.cap)
}

pub fn is_likely_change(tx: &TxNode, vout: u32, policy: &ChangePolicy) -> bool {
    change_probability(tx, vout, policy) >= policy.threshold
}

// ==============================================================================
// Simulation
// ==============================================================================

pub struct ExposureSimulator<'a> {
    tracer: Tracer<'a>,
    gateway: &'a ChainGateway,
    entities: &'a EntityRegistry,
    policy: &'a ExposurePolicy,
}

impl<'a> ExposureSimulator<'a> {
    pub fn new(
        tracer: Tracer<'a>,
        gateway: &'a ChainGateway,
        entities: &'a EntityRegistry,
        policy: &'a ExposurePolicy,
    ) -> Self {
        Self {
            tracer,
            gateway,
            entities,
            policy,
        }
    }

    /// Trace the output of `withdrawal_txid` paying `withdrawal_address`
    /// and score how linkable its destinations are.
    pub async fn simulate(
        &self,
        withdrawal_txid: Txid,
        withdrawal_address: &str,
        max_depth: u32,
        options: &TraceOptions,
        cancel: &Cancellation,
    ) -> Result<ExposureReport, ExposureError> {
        validate_depth(max_depth)?;
        let script = self.gateway.parse_address(withdrawal_address)?;
        let tx = self.gateway.get_transaction(&withdrawal_txid).await?;
        let vout = tx
            .outputs
            .iter()
            .position(|o| o.script_pub_key == script)
            .ok_or_else(|| {
                CoreError::InvalidInput(format!(
                    "{withdrawal_address} is not paid by transaction {withdrawal_txid}"
                ))
            })?;
        let origin = OutPoint::new(withdrawal_txid, vout as u32);

        let options = TraceOptions {
            coinjoin_stop: CoinJoinStop::AfterCrossings(self.policy.cold_crossings),
            ..options.clone()
        };
        info!(%origin, max_depth, "simulating exchange exposure");

        match self
            .tracer
            .trace(origin, Direction::Forward, max_depth, &options, cancel)
            .await
        {
            Ok(tree) => Ok(build_report(&tree, withdrawal_address, self.entities, self.policy)),
            Err(TraceError {
                partial, source, ..
            }) => Err(ExposureError {
                partial: partial.map(|tree| {
                    Box::new(build_report(&tree, withdrawal_address, self.entities, self.policy))
                }),
                source,
            }),
        }
    }
}

/// Score a finished (or partial) forward trace.
pub fn build_report(
    tree: &TraceTree,
    withdrawal_address: &str,
    entities: &EntityRegistry,
    policy: &ExposurePolicy,
) -> ExposureReport {
    let leaves: Vec<&TraceNode> = tree
        .leaves()
        .into_iter()
        // A converged leaf hands its value to a spender already in the tree.
        .filter(|n| !n.converged)
        .collect();

    let total_sats: u64 = leaves.iter().filter_map(|n| n.value).map(Amount::to_sat).sum();
    let mut destinations: Vec<Destination> = leaves
        .iter()
        .map(|leaf| destination(tree, leaf, total_sats, leaves.len(), entities, policy))
        .collect();
    destinations.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| a.hops.cmp(&b.hops))
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    });

    let linkability: f64 = destinations
        .iter()
        .map(|d| d.value_share * d.confidence_score)
        .sum();
    let score = (100.0 - policy.score_scale * linkability)
        .round()
        .clamp(0.0, 100.0) as u8;
    let rating = ExposureRating::from_score(score);

    let traced_sats: u64 = destinations
        .iter()
        .filter(|d| d.confidence >= ExposureConfidence::Medium)
        .filter_map(|d| d.value.map(Amount::to_sat))
        .sum();
    let high = destinations
        .iter()
        .filter(|d| d.confidence == ExposureConfidence::High)
        .count();
    let summary = format!(
        "{} destination(s) within {} hop(s), {} high confidence; exposure score {}/100 ({:?})",
        destinations.len(),
        tree.max_depth + 1,
        high,
        score,
        rating
    );
    debug!(score, destinations = destinations.len(), "exposure scored");

    let recommendations = recommend(tree, &destinations, score, policy);
    ExposureReport {
        withdrawal_txid: tree.origin.txid,
        withdrawal_address: withdrawal_address.to_owned(),
        origin: tree.origin,
        max_depth: tree.max_depth,
        score,
        rating,
        summary,
        traced_sats,
        untraceable_sats: total_sats.saturating_sub(traced_sats),
        coinjoins_on_paths: tree.coinjoins.len(),
        trace_nodes: tree.nodes.len(),
        truncated: tree.truncated,
        destinations,
        recommendations,
        warnings: tree.warnings.clone(),
    }
}

fn destination(
    tree: &TraceTree,
    leaf: &TraceNode,
    total_sats: u64,
    leaf_count: usize,
    entities: &EntityRegistry,
    policy: &ExposurePolicy,
) -> Destination {
    let path = tree.path(leaf.id);
    let hops = leaf.depth + 1;
    let coinjoins = leaf.crossings_on_path;

    // Each step after the origin followed one output of the spending tx.
    let forks = path
        .iter()
        .skip(1)
        .filter(|node| {
            tree.graph()
                .get(&node.outpoint.txid)
                .is_some_and(|tx| is_fork(tx) && !is_likely_change(tx, node.outpoint.vout, &policy.change))
        })
        .count() as u32;

    let trail = if coinjoins >= policy.cold_crossings {
        TrailStatus::Cold
    } else {
        match leaf.status {
            NodeStatus::Unspent => TrailStatus::Unspent,
            NodeStatus::StoppedAtCoinJoin => TrailStatus::Cold,
            NodeStatus::Unresolved => TrailStatus::Lost,
            NodeStatus::Unspendable => TrailStatus::DeadEnd,
            // Expanded or spent leaves only occur when the tree was truncated.
            _ => TrailStatus::DepthLimit,
        }
    };

    let (confidence_score, confidence) = if coinjoins >= policy.cold_crossings {
        (0.0, ExposureConfidence::Negligible)
    } else {
        let fork = policy.fork_factor.powi(forks as i32).max(policy.fork_floor);
        let mix = if coinjoins == 1 { policy.coinjoin_factor } else { 1.0 };
        let score = policy.hop_factor(hops) * fork * mix;
        (score, policy.band(score, hops, coinjoins))
    };

    let value_share = match (leaf.value, total_sats) {
        (Some(value), total) if total > 0 => value.to_sat() as f64 / total as f64,
        _ => 1.0 / leaf_count.max(1) as f64,
    };

    Destination {
        outpoint: leaf.outpoint,
        address: leaf.address.clone(),
        value: leaf.value,
        value_share,
        hops,
        coinjoins,
        forks,
        confidence_score: (confidence_score * 1000.0).round() / 1000.0,
        confidence,
        trail,
        entity: leaf
            .address
            .as_deref()
            .and_then(|a| entities.lookup_address(a))
            .cloned(),
    }
}

/// More than one spendable output to choose from.
fn is_fork(tx: &TxNode) -> bool {
    tx.outputs
        .iter()
        .filter(|o| !o.script_pub_key.is_op_return())
        .count()
        > 1
}

fn recommend(
    tree: &TraceTree,
    destinations: &[Destination],
    score: u8,
    policy: &ExposurePolicy,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let mut add = |kind, message: String| out.push(Recommendation { kind, message });

    if tree.coinjoins.is_empty() {
        add(
            RecommendationKind::UseCoinjoin,
            "no CoinJoin on any path; mixing after withdrawal breaks the exchange's view".into(),
        );
    }
    let high = destinations
        .iter()
        .filter(|d| d.confidence == ExposureConfidence::High)
        .count();
    if high > 0 {
        add(
            RecommendationKind::HighConfidenceDestinations,
            format!("{high} destination(s) are directly linkable to the withdrawal"),
        );
    }
    if score < policy.recommend_below {
        add(
            RecommendationKind::LowScore,
            format!("exposure score {score} is below {}", policy.recommend_below),
        );
    }
    if !tree.indexer_enabled {
        add(
            RecommendationKind::IndexerMissing,
            "no address indexer configured; spent outputs could not be followed".into(),
        );
    }
    let mut seen = HashSet::new();
    let reused = tree
        .nodes
        .iter()
        .filter_map(|n| n.address.as_deref())
        .any(|a| !seen.insert(a));
    if reused {
        add(
            RecommendationKind::AddressReuse,
            "an address appears more than once along the traced paths".into(),
        );
    }
    if out.is_empty() {
        out.push(Recommendation {
            kind: RecommendationKind::LooksGood,
            message: "no obvious links back to the withdrawal".into(),
        });
    }
    out
}
