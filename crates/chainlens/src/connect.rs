//! Wiring of the upstream collaborators: Bitcoin Core RPC and the optional
//! Electrum indexer.

use std::sync::Arc;

use eyre::{eyre, WrapErr};

use chainlens_core::indexer::{AddressIndexer, ElectrumClient, ElectrumConfig};
use chainlens_core::rpc::{BitcoinRpc, HttpRpcClient};
use chainlens_core::{ChainGateway, GatewayConfig};

use crate::cli::NodeArgs;

/// Connect to the node (and indexer, when configured) and verify both answer
/// before any analysis starts.
pub async fn connect_gateway(node: &NodeArgs, config: &GatewayConfig) -> eyre::Result<ChainGateway> {
    let rpc: Arc<dyn BitcoinRpc> = Arc::new(
        HttpRpcClient::new(
            &node.rpc_url,
            node.rpc_user.as_deref(),
            node.rpc_pass.as_deref(),
            node.rpc_cookie.as_deref(),
            node.rpc_requests_per_second,
            node.rpc_batch_size,
        )
        .wrap_err("configure Bitcoin Core RPC client")?,
    );

    let chain_info = rpc.get_blockchain_info().await.map_err(|err| {
        let message = format_rpc_connect_error(&node.rpc_url, &err.to_string());
        eyre!(message).wrap_err("while attempting to connect to Bitcoin Core RPC")
    })?;

    tracing::info!(
        chain = %chain_info.chain,
        blocks = chain_info.blocks,
        "connected to Bitcoin Core"
    );
    if chain_info.pruned {
        tracing::warn!("node is pruned; backward traces into old blocks may fail");
    }

    let indexer: Option<Arc<dyn AddressIndexer>> = match &node.electrum {
        Some(addr) => {
            let client = ElectrumClient::connect(ElectrumConfig::new(addr.as_str()))
                .await
                .wrap_err_with(|| format!("connect to Electrum server `{addr}`"))?;
            tracing::info!(server = %addr, "connected to Electrum indexer");
            let client: Arc<dyn AddressIndexer> = Arc::new(client);
            Some(client)
        }
        None => {
            tracing::info!(
                "no Electrum indexer configured; forward traces stop at the first spent output"
            );
            None
        }
    };

    Ok(ChainGateway::new(rpc, indexer, chain_info.network(), config))
}

fn format_rpc_connect_error(rpc_url: &str, source_error: &str) -> String {
    let mut lines = vec![
        format!("could not reach RPC endpoint `{rpc_url}`"),
        format!("RPC error: {source_error}"),
    ];

    let hint = if source_error.contains("Could not resolve host") || source_error.contains("dns error") {
        Some("hostname resolution failed; check the host part of --rpc-url")
    } else if source_error.contains("tls") || source_error.contains("certificate") {
        Some("TLS handshake failed; check that the endpoint really serves HTTPS")
    } else if source_error.contains("401") || source_error.contains("403") {
        Some("authentication failed; check --rpc-user/--rpc-pass or --rpc-cookie")
    } else if source_error.contains("cookie") {
        Some("the cookie file could not be read; is bitcoind running with this datadir?")
    } else if source_error.contains("error sending request") || source_error.contains("Connection refused") {
        Some("is bitcoind running with -server=1 and listening on this port?")
    } else {
        None
    };
    if let Some(hint) = hint {
        lines.push(format!("hint: {hint}"));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_adds_auth_hint() {
        let message = format_rpc_connect_error("http://127.0.0.1:8332", "HTTP status 401");
        assert!(message.contains("`http://127.0.0.1:8332`"));
        assert!(message.ends_with("hint: authentication failed; check --rpc-user/--rpc-pass or --rpc-cookie"));
    }

    #[test]
    fn unknown_errors_have_no_hint() {
        let message = format_rpc_connect_error("http://node:8332", "something odd");
        assert_eq!(message.lines().count(), 2);
    }
}
