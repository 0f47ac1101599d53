mod cli;
mod connect;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use serde::Serialize;

use chainlens_core::cluster::ClusterStore;
use chainlens_core::entities::EntityRegistry;
use chainlens_core::exposure::DepthPreset;
use chainlens_core::types::{parse_outpoint, parse_txid};
use chainlens_core::{Cancellation, Engine, EngineConfig};

use cli::{ClusterCommand, Command};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let mut config = match &args.policy_file {
        Some(path) => EngineConfig::from_json_file(path).wrap_err("load policy file")?,
        None => EngineConfig::default(),
    };
    if let Some(concurrency) = args.rpc_concurrency {
        config.gateway.concurrency = concurrency;
        config.validate().wrap_err("apply --rpc-concurrency")?;
    }

    let gateway = connect::connect_gateway(&args.node, &config.gateway).await?;

    let clusters = match &args.cluster_snapshot {
        Some(path) => load_cluster_snapshot(path).await?,
        None => ClusterStore::new(),
    };
    let mut engine = Engine::new(gateway, config).with_clusters(Arc::new(clusters));
    if let Some(dir) = &args.entity_dir {
        let entities = EntityRegistry::load_dir(dir).wrap_err("load entity label directory")?;
        engine = engine.with_entities(entities);
    }

    let mut cancel = Cancellation::new();
    if let Some(secs) = args.timeout_secs {
        cancel = cancel.with_timeout(Duration::from_secs(secs));
    }
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing with partial results");
            on_ctrl_c.cancel();
        }
    });

    let outcome = run(&engine, args.command, &cancel).await;

    if let Some(path) = &args.cluster_snapshot {
        save_cluster_snapshot(engine.clusters(), path).await?;
    }
    outcome
}

async fn run(engine: &Engine, command: Command, cancel: &Cancellation) -> eyre::Result<()> {
    let defaults = engine.config();
    match command {
        Command::Info => {
            let chain = engine.gateway().chain_info().await.wrap_err("query chain info")?;
            print_json(&serde_json::json!({
                "chain": chain,
                "network": engine.gateway().network().to_string(),
                "indexer_enabled": engine.gateway().indexer_enabled(),
            }))
        }

        Command::Classify { txid } => {
            let txid = parse_txid(&txid)?;
            let report = cancel
                .run("classify", engine.classify(txid))
                .await
                .wrap_err_with(|| format!("classify {txid}"))?;
            print_json(&report)
        }

        Command::Trace {
            outpoint,
            direction,
            depth,
        } => {
            let origin = parse_outpoint(&outpoint)?;
            let max_depth = depth.resolve(DepthPreset::Standard.depth());
            match engine.trace(origin, direction, max_depth, cancel).await {
                Ok(tree) => print_json(&serde_json::json!({
                    "summary": tree.summary(),
                    "tree": tree,
                })),
                Err(err) => {
                    if let Some(partial) = &err.partial {
                        print_json(partial)?;
                    }
                    Err(err).wrap_err_with(|| format!("{direction} trace from {origin}"))
                }
            }
        }

        Command::Tree {
            txid,
            forward_depth,
            backward_depth,
        } => {
            let txid = parse_txid(&txid)?;
            match engine.utxo_tree(txid, forward_depth, backward_depth, cancel).await {
                Ok(tree) => print_json(&tree),
                Err(err) => {
                    if let Some(partial) = &err.partial {
                        print_json(partial)?;
                    }
                    Err(err).wrap_err_with(|| format!("utxo tree around {txid}"))
                }
            }
        }

        Command::Score { outpoint, depth } => {
            let outpoint = parse_outpoint(&outpoint)?;
            let report = engine
                .score_utxo(outpoint, depth.resolve(defaults.history_depth), cancel)
                .await
                .wrap_err_with(|| format!("score {outpoint}"))?;
            print_json(&report)
        }

        Command::ScoreAddress { address, depth } => {
            match engine
                .score_address_utxos(&address, depth.resolve(defaults.history_depth), cancel)
                .await
            {
                Ok(reports) => print_json(&reports),
                Err(err) => {
                    if !err.partial.is_empty() {
                        print_json(&err.partial)?;
                    }
                    Err(err).wrap_err_with(|| format!("score utxos of {address}"))
                }
            }
        }

        Command::Exposure {
            txid,
            address,
            depth,
        } => {
            let txid = parse_txid(&txid)?;
            let max_depth = depth.resolve(DepthPreset::Standard.depth());
            match engine.simulate_exposure(txid, &address, max_depth, cancel).await {
                Ok(report) => print_json(&report),
                Err(err) => {
                    if let Some(partial) = &err.partial {
                        print_json(partial)?;
                    }
                    Err(err).wrap_err_with(|| format!("exposure of {address} in {txid}"))
                }
            }
        }

        Command::Dust { address, threshold } => {
            let report = engine
                .scan_dust(&address, threshold)
                .await
                .wrap_err_with(|| format!("dust scan of {address}"))?;
            print_json(&report)
        }

        Command::Cluster(ClusterCommand::Merge { addresses }) => {
            engine.merge(&addresses).wrap_err("merge addresses")?;
            print_json(&engine.cluster_of(&addresses[0])?)
        }

        Command::Cluster(ClusterCommand::Show { address }) => {
            print_json(&engine.cluster_of(&address)?)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> eyre::Result<()> {
    let rendered = serde_json::to_string_pretty(value).wrap_err("encode result as JSON")?;
    println!("{rendered}");
    Ok(())
}

async fn load_cluster_snapshot(path: &Path) -> eyre::Result<ClusterStore> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let store = ClusterStore::from_json(&raw)
                .wrap_err_with(|| format!("load cluster snapshot {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                addresses = store.address_count(),
                "loaded cluster snapshot"
            );
            Ok(store)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no cluster snapshot yet; starting empty");
            Ok(ClusterStore::new())
        }
        Err(err) => {
            Err(err).wrap_err_with(|| format!("read cluster snapshot {}", path.display()))
        }
    }
}

async fn save_cluster_snapshot(clusters: &ClusterStore, path: &Path) -> eyre::Result<()> {
    let raw = clusters.to_json().wrap_err("encode cluster snapshot")?;
    tokio::fs::write(path, raw)
        .await
        .wrap_err_with(|| format!("write cluster snapshot {}", path.display()))?;
    tracing::debug!(path = %path.display(), addresses = clusters.address_count(), "saved cluster snapshot");
    Ok(())
}
