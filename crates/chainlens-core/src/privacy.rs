//! Per-UTXO privacy scoring.
//!
//! [`score_utxo`] is a pure function over [`UtxoSignals`]; gathering the
//! signals (backward trace, clustering, indexer history) is the engine's
//! job. Every factor contributes a signed weight to a baseline and the sum
//! is clamped to 0..=100.

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::enrich::is_round_value;

// ==============================================================================
// Policy
// ==============================================================================

/// Bonus for UTXOs at least `min_confirmations` deep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeBonus {
    pub min_confirmations: u32,
    pub bonus: f64,
}

/// Penalty for UTXOs at most `max_hops` away from a known entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityPenalty {
    pub max_hops: u32,
    pub penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyPolicy {
    pub baseline: f64,
    /// Cluster penalty is `per_doubling * log2(n)`, capped.
    pub cluster_penalty_per_doubling: f64,
    pub cluster_penalty_cap: f64,
    /// Bonus for the first CoinJoin pass; pass `i` earns
    /// `max(first * decay^(i-1), 1)`.
    pub coinjoin_first_pass_bonus: f64,
    pub coinjoin_decay: f64,
    pub address_reuse_penalty: f64,
    pub round_value_unit_sats: u64,
    pub round_value_penalty: f64,
    pub dust_threshold_sats: u64,
    pub dust_penalty: f64,
    pub age_bonuses: Vec<AgeBonus>,
    /// Ordered by `max_hops`; the first matching tier applies.
    pub entity_penalties: Vec<EntityPenalty>,
    pub good_min: u8,
    pub moderate_min: u8,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            baseline: 50.0,
            cluster_penalty_per_doubling: 6.0,
            cluster_penalty_cap: 25.0,
            coinjoin_first_pass_bonus: 25.0,
            coinjoin_decay: 0.5,
            address_reuse_penalty: 15.0,
            round_value_unit_sats: 100_000,
            round_value_penalty: 10.0,
            dust_threshold_sats: 1_000,
            dust_penalty: 10.0,
            age_bonuses: vec![
                AgeBonus {
                    min_confirmations: 4_320,
                    bonus: 2.0,
                },
                AgeBonus {
                    min_confirmations: 52_560,
                    bonus: 5.0,
                },
            ],
            entity_penalties: vec![
                EntityPenalty {
                    max_hops: 0,
                    penalty: 30.0,
                },
                EntityPenalty {
                    max_hops: 1,
                    penalty: 20.0,
                },
                EntityPenalty {
                    max_hops: 2,
                    penalty: 12.0,
                },
                EntityPenalty {
                    max_hops: 4,
                    penalty: 6.0,
                },
            ],
            good_min: 70,
            moderate_min: 30,
        }
    }
}

impl PrivacyPolicy {
    pub fn rating(&self, score: u8) -> PrivacyRating {
        if score >= self.good_min {
            PrivacyRating::Good
        } else if score >= self.moderate_min {
            PrivacyRating::Moderate
        } else {
            PrivacyRating::Poor
        }
    }
}

// ==============================================================================
// Signals and Results
// ==============================================================================

/// Everything the scorer needs to know about one UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSignals {
    pub value: Amount,
    /// Size of the owning address's cluster; 1 when unclustered.
    pub cluster_size: usize,
    /// CoinJoins crossed along the backward history.
    pub coinjoin_passes: u32,
    pub address_reused: bool,
    /// The UTXO is itself a CoinJoin output; round denominations are
    /// expected there and not penalized.
    pub created_by_coinjoin: bool,
    pub confirmations: Option<u32>,
    /// Hops to the nearest address attributed to a known entity.
    pub entity_distance: Option<u32>,
    /// Name of that entity, for the factor label.
    pub entity_name: Option<String>,
}

impl UtxoSignals {
    /// Signals for a fresh, unclustered, never-mixed UTXO.
    pub fn new(value: Amount) -> Self {
        Self {
            value,
            cluster_size: 1,
            coinjoin_passes: 0,
            address_reused: false,
            created_by_coinjoin: false,
            confirmations: None,
            entity_distance: None,
            entity_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyRating {
    Poor,
    Moderate,
    Good,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    ClusterSize,
    CoinjoinPasses,
    AddressReuse,
    RoundValue,
    Dust,
    Age,
    EntityProximity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorSign {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyFactor {
    pub kind: FactorKind,
    pub label: String,
    pub sign: FactorSign,
    /// Magnitude, always non-negative.
    pub weight: f64,
}

impl PrivacyFactor {
    fn signed(&self) -> f64 {
        match self.sign {
            FactorSign::Positive => self.weight,
            FactorSign::Negative => -self.weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyScore {
    pub score: u8,
    pub rating: PrivacyRating,
    pub factors: Vec<PrivacyFactor>,
    pub dust_warning: bool,
}

// ==============================================================================
// Scoring
// ==============================================================================

pub fn score_utxo(signals: &UtxoSignals, policy: &PrivacyPolicy) -> PrivacyScore {
    let mut factors = Vec::new();
    let mut push = |kind, label: String, sign, weight: f64| {
        if weight > 0.0 {
            factors.push(PrivacyFactor {
                kind,
                label,
                sign,
                weight: round1(weight),
            });
        }
    };

    if signals.cluster_size > 1 {
        let penalty = (policy.cluster_penalty_per_doubling * (signals.cluster_size as f64).log2())
            .min(policy.cluster_penalty_cap);
        push(
            FactorKind::ClusterSize,
            format!("address clusters with {} others", signals.cluster_size - 1),
            FactorSign::Negative,
            penalty,
        );
    }

    if signals.coinjoin_passes > 0 {
        push(
            FactorKind::CoinjoinPasses,
            format!("{} CoinJoin pass(es) in history", signals.coinjoin_passes),
            FactorSign::Positive,
            coinjoin_bonus(signals.coinjoin_passes, policy),
        );
    }

    if signals.address_reused {
        push(
            FactorKind::AddressReuse,
            "address received funds more than once".into(),
            FactorSign::Negative,
            policy.address_reuse_penalty,
        );
    }

    if !signals.created_by_coinjoin && is_round_value(signals.value, policy.round_value_unit_sats)
    {
        push(
            FactorKind::RoundValue,
            format!("round amount ({} sat)", signals.value.to_sat()),
            FactorSign::Negative,
            policy.round_value_penalty,
        );
    }

    let dust_warning = signals.value.to_sat() <= policy.dust_threshold_sats;
    if dust_warning {
        push(
            FactorKind::Dust,
            format!("dust-sized output (<= {} sat)", policy.dust_threshold_sats),
            FactorSign::Negative,
            policy.dust_penalty,
        );
    }

    if let Some(confirmations) = signals.confirmations {
        let bonus = policy
            .age_bonuses
            .iter()
            .filter(|tier| confirmations >= tier.min_confirmations)
            .map(|tier| tier.bonus)
            .fold(0.0, f64::max);
        push(
            FactorKind::Age,
            format!("{confirmations} confirmations"),
            FactorSign::Positive,
            bonus,
        );
    }

    if let Some(hops) = signals.entity_distance {
        if let Some(tier) = policy.entity_penalties.iter().find(|t| hops <= t.max_hops) {
            let who = signals.entity_name.as_deref().unwrap_or("a known entity");
            push(
                FactorKind::EntityProximity,
                format!("{hops} hop(s) from {who}"),
                FactorSign::Negative,
                tier.penalty,
            );
        }
    }

    let total = policy.baseline + factors.iter().map(PrivacyFactor::signed).sum::<f64>();
    let score = total.round().clamp(0.0, 100.0) as u8;
    PrivacyScore {
        score,
        rating: policy.rating(score),
        factors,
        dust_warning,
    }
}

/// Sum of diminishing per-pass bonuses. Every pass is worth at least one
/// point so the score keeps rising with each extra pass.
fn coinjoin_bonus(passes: u32, policy: &PrivacyPolicy) -> f64 {
    (0..passes)
        .map(|i| {
            (policy.coinjoin_first_pass_bonus * policy.coinjoin_decay.powi(i as i32))
                .max(MIN_PASS_BONUS)
        })
        .sum()
}

const MIN_PASS_BONUS: f64 = 1.0;

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
