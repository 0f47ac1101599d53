use std::collections::HashSet;
use std::sync::{Arc, Once};
use std::{env, fs};

use bitcoin::{OutPoint, Txid};
use chainlens_core::rpc::{BitcoinRpc, HttpRpcClient};
use chainlens_core::tracer::NodeStatus;
use chainlens_core::{Cancellation, ChainGateway, Direction, Engine, EngineConfig};
use serde::Deserialize;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chainlens_core=debug")),
            )
            .with_target(true)
            .try_init();
    });
}

#[derive(Debug, Deserialize)]
struct TraceFixture {
    scenarios: Vec<TraceScenario>,
}

#[derive(Debug, Deserialize)]
struct TraceScenario {
    name: String,
    origin: String,
    max_depth: u32,
    #[serde(default)]
    expect_coinbase_origin: bool,
    #[serde(default)]
    expect_coinjoin: Option<String>,
    #[serde(default)]
    required_txids: Vec<String>,
    #[serde(default)]
    expected_node_count: Option<usize>,
}

fn parse_outpoint(raw: &str) -> OutPoint {
    let (txid, vout) = raw
        .split_once(':')
        .expect("origin must be formatted as txid:vout");
    OutPoint::new(
        txid.parse().expect("origin txid must parse"),
        vout.parse().expect("origin vout must parse"),
    )
}

async fn regtest_engine() -> Engine {
    let rpc_url = env::var("CHAINLENS_TEST_RPC_URL").expect("CHAINLENS_TEST_RPC_URL must be set");
    let rpc_user = env::var("CHAINLENS_TEST_RPC_USER").expect("CHAINLENS_TEST_RPC_USER must be set");
    let rpc_pass = env::var("CHAINLENS_TEST_RPC_PASS").expect("CHAINLENS_TEST_RPC_PASS must be set");

    let rpc = Arc::new(
        HttpRpcClient::new(&rpc_url, Some(&rpc_user), Some(&rpc_pass), None, None, 10)
            .expect("rpc client must construct"),
    );
    let network = rpc
        .get_blockchain_info()
        .await
        .expect("regtest get_blockchain_info must succeed")
        .network();
    let config = EngineConfig::default();
    let gateway = ChainGateway::new(rpc, None, network, &config.gateway);
    Engine::new(gateway, config)
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind with CHAINLENS_TEST_TRACE_FIXTURE_FILE"]
async fn regtest_backward_traces_match_fixture_scenarios() {
    init_tracing();

    let fixture_file = env::var("CHAINLENS_TEST_TRACE_FIXTURE_FILE")
        .expect("CHAINLENS_TEST_TRACE_FIXTURE_FILE must be set");
    let fixture_raw = fs::read_to_string(&fixture_file).expect("trace fixture must be readable");
    let fixture: TraceFixture =
        serde_json::from_str(&fixture_raw).expect("trace fixture must contain valid JSON");
    assert!(!fixture.scenarios.is_empty(), "fixture must define scenarios");

    let engine = regtest_engine().await;

    for scenario in &fixture.scenarios {
        eprintln!("[itest] scenario {}", scenario.name);
        let origin = parse_outpoint(&scenario.origin);
        let tree = engine
            .trace(origin, Direction::Backward, scenario.max_depth, &Cancellation::new())
            .await
            .unwrap_or_else(|e| panic!("{}: trace failed: {e}", scenario.name));

        assert_eq!(tree.root().map(|n| n.outpoint), Some(origin), "{}", scenario.name);
        for (i, node) in tree.nodes.iter().enumerate() {
            assert_eq!(node.id, i, "{}: node ids must be positional", scenario.name);
            assert!(node.depth <= scenario.max_depth, "{}: node beyond max depth", scenario.name);
            if let Some(parent) = node.parent {
                assert_eq!(
                    tree.nodes[parent].depth + 1,
                    node.depth,
                    "{}: child depth must follow its parent",
                    scenario.name
                );
            }
        }

        let txids: HashSet<Txid> = tree.nodes.iter().map(|n| n.outpoint.txid).collect();
        for required in &scenario.required_txids {
            let txid: Txid = required.parse().expect("required txid must parse");
            assert!(txids.contains(&txid), "{}: missing {txid}", scenario.name);
        }
        if let Some(count) = scenario.expected_node_count {
            assert_eq!(tree.nodes.len(), count, "{}", scenario.name);
        }
        if scenario.expect_coinbase_origin {
            assert!(
                tree.nodes.iter().any(|n| n.status == NodeStatus::Coinbase),
                "{}: expected a coinbase leaf",
                scenario.name
            );
        }
        if let Some(txid) = &scenario.expect_coinjoin {
            let txid: Txid = txid.parse().expect("coinjoin txid must parse");
            assert!(
                tree.coinjoins.iter().any(|hit| hit.txid == txid),
                "{}: expected {txid} to be detected as a coinjoin",
                scenario.name
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind with CHAINLENS_TEST_TXIDS_FILE"]
async fn regtest_classification_and_clustering_run_over_fixture_txs() {
    init_tracing();

    let txids_file =
        env::var("CHAINLENS_TEST_TXIDS_FILE").expect("CHAINLENS_TEST_TXIDS_FILE must be set");
    let engine = regtest_engine().await;

    let raw = fs::read_to_string(&txids_file).expect("txid fixture must be readable");
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let txid: Txid = line.parse().expect("fixture txid must parse");
        let report = engine
            .classify(txid)
            .await
            .expect("classification must succeed for fixture txs");
        assert_eq!(report.txid, txid);
        assert!(report.analysis.score <= 100);

        let tx = engine
            .gateway()
            .get_transaction(&txid)
            .await
            .expect("fixture tx must be fetchable");
        let inputs = tx.input_addresses();
        if inputs.len() > 1 && !report.analysis.is_coinjoin(engine.config().detector.threshold) {
            let first = engine.find(inputs[0]).expect("input address must be valid");
            for address in &inputs[1..] {
                assert_eq!(
                    engine.find(address).expect("input address must be valid"),
                    first,
                    "{txid}: co-spent inputs must share a cluster"
                );
            }
        }
    }
}
