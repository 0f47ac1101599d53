//! HTTP transport for [`BitcoinRpc`](super::BitcoinRpc).
//!
//! `envelope` frames JSON-RPC calls, `transport` delivers them (auth,
//! throttling, concurrent batch chunks), `decode` maps Bitcoin Core's verbose
//! replies into [`TxNode`](crate::types::TxNode)s, and `client` ties these
//! to the trait.

mod client;
mod credentials;
mod decode;
mod envelope;
mod transport;

pub use client::HttpRpcClient;
