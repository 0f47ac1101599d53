//! Bitcoin chain analysis: UTXO tracing, CoinJoin detection, CIOH address
//! clustering, privacy scoring and KYC exposure simulation over data from a
//! Bitcoin Core node and an optional Electrum indexer.

pub mod cache;
pub mod cancel;
pub mod cluster;
pub mod coinjoin;
pub mod config;
pub mod engine;
pub mod enrich;
pub mod entities;
pub mod error;
pub mod exposure;
pub mod gateway;
pub mod graph;
pub mod indexer;
pub mod privacy;
pub mod retry;
pub mod rpc;
pub mod tracer;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use cancel::Cancellation;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::CoreError;
pub use gateway::{ChainGateway, GatewayConfig};
pub use types::{Direction, HARD_MAX_DEPTH};
