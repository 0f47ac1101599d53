//! Engine configuration: every tunable weight, threshold and limit.
//!
//! All sections deserialize with `#[serde(default)]`, so a policy file only
//! needs the values it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coinjoin::DetectorPolicy;
use crate::error::CoreError;
use crate::exposure::ExposurePolicy;
use crate::gateway::GatewayConfig;
use crate::privacy::PrivacyPolicy;
use crate::tracer::TraceOptions;

/// Relay dust limit for P2PKH outputs, in satoshis.
pub const RELAY_DUST_LIMIT_SATS: u64 = 546;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DustPolicy {
    /// Outputs at or below this value are reported by a dust scan.
    pub threshold_sats: u64,
    /// Outputs below this value are flagged as likely dust attacks.
    pub attack_below_sats: u64,
}

impl Default for DustPolicy {
    fn default() -> Self {
        Self {
            threshold_sats: 1_000,
            attack_below_sats: RELAY_DUST_LIMIT_SATS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gateway: GatewayConfig,
    pub detector: DetectorPolicy,
    pub privacy: PrivacyPolicy,
    pub exposure: ExposurePolicy,
    pub trace: TraceOptions,
    pub dust: DustPolicy,
    /// Backward depth used to gather privacy signals for a UTXO.
    pub history_depth: u32,
    /// UTXOs scored at once by `score_address_utxos`.
    pub bulk_concurrency: usize,
    /// History entries inspected when checking an address for reuse.
    pub reuse_scan_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            detector: DetectorPolicy::default(),
            privacy: PrivacyPolicy::default(),
            exposure: ExposurePolicy::default(),
            trace: TraceOptions::default(),
            dust: DustPolicy::default(),
            history_depth: 6,
            bulk_concurrency: 4,
            reuse_scan_limit: 50,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| CoreError::Config(format!("parse policy file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.gateway.concurrency == 0 {
            return Err(CoreError::Config("gateway.concurrency must be at least 1".into()));
        }
        if self.gateway.spend_scan_limit == 0 {
            return Err(CoreError::Config("gateway.spend_scan_limit must be at least 1".into()));
        }
        if self.bulk_concurrency == 0 {
            return Err(CoreError::Config("bulk_concurrency must be at least 1".into()));
        }
        if self.detector.threshold > 100 {
            return Err(CoreError::Config("detector.threshold must be 0..=100".into()));
        }
        if self.privacy.moderate_min > self.privacy.good_min {
            return Err(CoreError::Config(
                "privacy.moderate_min must not exceed privacy.good_min".into(),
            ));
        }
        crate::types::validate_depth(self.history_depth)
            .map_err(|e| CoreError::Config(format!("history_depth: {e}")))?;
        Ok(())
    }
}
