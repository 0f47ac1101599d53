//! Forward/backward UTXO tracing.
//!
//! A trace starts at one output and walks the spend relation level by level
//! (BFS). Backward, an output's creating transaction is expanded into the
//! outputs its inputs consumed. Forward, the output's spender is resolved
//! through the gateway and expanded into every output it created. Each
//! visited transaction is classified by the CoinJoin detector, and
//! non-CoinJoin transactions feed CIOH evidence to the cluster store.
//!
//! Gateway lookups for a whole level run concurrently (bounded by the
//! gateway's permits); nodes are appended strictly in depth order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bitcoin::{Amount, OutPoint, Txid};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::cluster::ClusterStore;
use crate::coinjoin::{CoinJoinAnalysis, CoinJoinDetector, CoinJoinProtocol};
use crate::error::CoreError;
use crate::gateway::ChainGateway;
use crate::graph::{SpendEdge, TxGraph};
use crate::types::{validate_depth, BlockHeight, Direction, SpendRef, SpendStatus, TxNode};

/// Default cap on the number of nodes in one trace tree.
pub const DEFAULT_MAX_NODES: usize = 500;

// ==============================================================================
// Trace Types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Backward: the creating transaction's inputs were followed.
    Expanded,
    /// Forward: the output was spent and the spender was followed.
    Spent,
    Unspent,
    /// Provably unspendable (OP_RETURN).
    Unspendable,
    /// Created by a coinbase transaction: origin of newly issued coins.
    Coinbase,
    DepthLimitReached,
    /// The next hop exists (or may exist) but could not be observed.
    Unresolved,
    /// Stopped by [`CoinJoinStop::AfterCrossings`].
    StoppedAtCoinJoin,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Expanded | Self::Spent)
    }
}

/// Whether traversal continues through CoinJoin transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "crossings")]
pub enum CoinJoinStop {
    #[default]
    Never,
    /// Stop once a path has crossed this many CoinJoins.
    AfterCrossings(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    pub max_nodes: usize,
    pub coinjoin_stop: CoinJoinStop,
    /// Feed CIOH evidence from visited transactions into the cluster store.
    pub merge_clusters: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            coinjoin_stop: CoinJoinStop::Never,
            merge_clusters: true,
        }
    }
}

/// One visited output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub id: usize,
    pub parent: Option<usize>,
    pub depth: u32,
    pub direction: Direction,
    pub outpoint: OutPoint,
    pub value: Option<Amount>,
    pub address: Option<String>,
    pub block_height: Option<BlockHeight>,
    pub block_time: Option<u64>,
    pub status: NodeStatus,
    /// CoinJoin score of the transaction that created this output.
    pub coinjoin_score: u8,
    pub coinjoin_protocol: CoinJoinProtocol,
    /// The creating transaction scored at or above the CoinJoin threshold.
    pub coinjoin_crossing: bool,
    /// CoinJoin crossings from the origin down to this node, inclusive.
    pub crossings_on_path: u32,
    pub spent_by: Option<SpendRef>,
    /// The transaction this node leads to was already expanded elsewhere in
    /// the tree, so the node has no children of its own.
    pub converged: bool,
    /// Reported `Unspent` only because no indexer could resolve a spend the
    /// node knows about.
    pub spend_unverified: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinHit {
    pub txid: Txid,
    pub analysis: CoinJoinAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub node_count: usize,
    pub max_depth_reached: u32,
    pub coinjoin_count: usize,
    pub statuses: BTreeMap<NodeStatus, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTree {
    pub origin: OutPoint,
    pub direction: Direction,
    pub max_depth: u32,
    pub indexer_enabled: bool,
    /// In strict depth order; `nodes[i].id == i`.
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<SpendEdge>,
    pub coinjoins: Vec<CoinJoinHit>,
    pub warnings: Vec<String>,
    pub truncated: bool,
    #[serde(skip)]
    graph: TxGraph,
}

impl TraceTree {
    fn new(origin: OutPoint, direction: Direction, max_depth: u32, indexer_enabled: bool) -> Self {
        Self {
            origin,
            direction,
            max_depth,
            indexer_enabled,
            nodes: Vec::new(),
            edges: Vec::new(),
            coinjoins: Vec::new(),
            warnings: Vec::new(),
            truncated: false,
            graph: TxGraph::new(),
        }
    }

    pub fn graph(&self) -> &TxGraph {
        &self.graph
    }

    pub fn root(&self) -> Option<&TraceNode> {
        self.nodes.first()
    }

    pub fn children(&self, id: usize) -> impl Iterator<Item = &TraceNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }

    /// Nodes without children.
    pub fn leaves(&self) -> Vec<&TraceNode> {
        let parents: HashSet<usize> = self.nodes.iter().filter_map(|n| n.parent).collect();
        self.nodes
            .iter()
            .filter(|n| !parents.contains(&n.id))
            .collect()
    }

    /// Nodes from the origin down to `id`, inclusive.
    pub fn path(&self, id: usize) -> Vec<&TraceNode> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            path.push(node);
            cursor = node.parent.and_then(|p| self.nodes.get(p));
        }
        path.reverse();
        path
    }

    pub fn max_crossings(&self) -> u32 {
        self.nodes
            .iter()
            .map(|n| n.crossings_on_path)
            .max()
            .unwrap_or(0)
    }

    pub fn summary(&self) -> TraceSummary {
        let mut statuses = BTreeMap::new();
        for node in &self.nodes {
            *statuses.entry(node.status).or_insert(0) += 1;
        }
        TraceSummary {
            node_count: self.nodes.len(),
            max_depth_reached: self.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
            coinjoin_count: self.coinjoins.len(),
            statuses,
        }
    }
}

/// A trace that could not finish. `partial` holds every level completed
/// before the failure; it is `None` when the failure happened before any
/// work (invalid input, origin not found).
#[derive(Debug, thiserror::Error)]
#[error("trace failed{}: {source}", .failed_at.map(|o| format!(" at {o}")).unwrap_or_default())]
pub struct TraceError {
    pub partial: Option<Box<TraceTree>>,
    pub failed_at: Option<OutPoint>,
    #[source]
    pub source: CoreError,
}

impl TraceError {
    fn new(tree: TraceTree, failed_at: Option<OutPoint>, source: CoreError) -> Self {
        let partial = match source {
            CoreError::InvalidInput(_) | CoreError::TxNotFound(_) => None,
            _ => Some(Box::new(tree)),
        };
        Self {
            partial,
            failed_at,
            source,
        }
    }

    fn early(source: CoreError) -> Self {
        Self {
            partial: None,
            failed_at: None,
            source,
        }
    }
}

// ==============================================================================
// Tracer
// ==============================================================================

struct Pending {
    parent: Option<usize>,
    outpoint: OutPoint,
    depth: u32,
    inherited_crossings: u32,
    known_value: Option<Amount>,
    known_address: Option<String>,
}

struct Visit {
    pending: Pending,
    tx: Option<Arc<TxNode>>,
    crossing: bool,
    crossings: u32,
    score: u8,
    protocol: CoinJoinProtocol,
    status: Option<NodeStatus>,
    spent_by: Option<SpendRef>,
    spend_unverified: bool,
    note: Option<String>,
}

#[derive(Default)]
struct WalkState {
    visited: HashSet<OutPoint>,
    expanded: HashSet<Txid>,
    analyses: HashMap<Txid, CoinJoinAnalysis>,
    scheduled: usize,
    unverified: usize,
    scan_capped: usize,
}

/// Walks the spend graph for one request. Borrowed collaborators let the
/// engine share its gateway, detector and clusters across traces.
pub struct Tracer<'a> {
    gateway: &'a ChainGateway,
    detector: &'a CoinJoinDetector,
    clusters: &'a ClusterStore,
}

impl<'a> Tracer<'a> {
    pub fn new(
        gateway: &'a ChainGateway,
        detector: &'a CoinJoinDetector,
        clusters: &'a ClusterStore,
    ) -> Self {
        Self {
            gateway,
            detector,
            clusters,
        }
    }

    /// Trace from `origin` in `direction` for at most `max_depth` hops.
    ///
    /// A node at `depth == max_depth` is `DepthLimitReached`, so
    /// `max_depth == 0` yields just the origin.
    pub async fn trace(
        &self,
        origin: OutPoint,
        direction: Direction,
        max_depth: u32,
        options: &TraceOptions,
        cancel: &Cancellation,
    ) -> Result<TraceTree, TraceError> {
        validate_depth(max_depth).map_err(TraceError::early)?;
        if options.max_nodes == 0 {
            return Err(TraceError::early(CoreError::InvalidInput(
                "max_nodes must be at least 1".into(),
            )));
        }

        info!(%origin, %direction, max_depth, "trace started");
        let mut tree = TraceTree::new(origin, direction, max_depth, self.gateway.indexer_enabled());
        let mut state = WalkState {
            scheduled: 1,
            ..WalkState::default()
        };
        state.visited.insert(origin);

        let mut level = vec![Pending {
            parent: None,
            outpoint: origin,
            depth: 0,
            inherited_crossings: 0,
            known_value: None,
            known_address: None,
        }];

        while !level.is_empty() {
            let depth = level[0].depth;
            debug!(depth, width = level.len(), "trace level");
            level = match self
                .step(level, &mut tree, &mut state, options, cancel)
                .await
            {
                Ok(next) => next,
                Err((failed_at, source)) => {
                    warn!(%origin, ?failed_at, error = %source, "trace aborted");
                    finish_warnings(&mut tree, &state);
                    return Err(TraceError::new(tree, failed_at, source));
                }
            };
        }

        finish_warnings(&mut tree, &state);
        info!(
            %origin,
            nodes = tree.nodes.len(),
            coinjoins = tree.coinjoins.len(),
            truncated = tree.truncated,
            "trace finished"
        );
        Ok(tree)
    }

    /// Visit one BFS level and return the next one.
    async fn step(
        &self,
        level: Vec<Pending>,
        tree: &mut TraceTree,
        state: &mut WalkState,
        options: &TraceOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<Pending>, (Option<OutPoint>, CoreError)> {
        let direction = tree.direction;
        let max_depth = tree.max_depth;

        // Phase A: creating transactions for every node of the level.
        let txids = unique(level.iter().map(|p| p.outpoint.txid));
        let fetched = cancel
            .run("trace", async {
                Ok(join_all(txids.iter().map(|t| self.gateway.get_transaction(t))).await)
            })
            .await
            .map_err(|e| (None, e))?;
        let mut owning: HashMap<Txid, Result<Arc<TxNode>, CoreError>> =
            txids.into_iter().zip(fetched).collect();

        let mut visits = Vec::with_capacity(level.len());
        for pending in level {
            let txid = pending.outpoint.txid;
            let is_origin = pending.parent.is_none();
            let tx = match owning.get(&txid) {
                Some(Ok(tx)) => Some(Arc::clone(tx)),
                Some(Err(CoreError::TxNotFound(_))) if !is_origin => None,
                _ => {
                    let source = match owning.remove(&txid) {
                        Some(Err(e)) => e,
                        _ => CoreError::TxNotFound(txid),
                    };
                    return Err((Some(pending.outpoint), source));
                }
            };
            if is_origin {
                if let Some(tx) = &tx {
                    if tx.output(pending.outpoint.vout).is_none() {
                        return Err((
                            Some(pending.outpoint),
                            CoreError::InvalidInput(format!(
                                "vout {} out of range for {} ({} outputs)",
                                pending.outpoint.vout,
                                txid,
                                tx.outputs.len()
                            )),
                        ));
                    }
                }
            }
            visits.push(self.classify_visit(pending, tx, tree, state, options, max_depth));
        }

        if direction == Direction::Forward {
            self.resolve_spends(&mut visits, tree, state, cancel).await?;
        }

        // Phase B (forward) fetched spenders; now materialize nodes in order.
        let mut next = Vec::new();
        for visit in visits {
            self.finalize(visit, tree, state, options, &mut next);
        }
        Ok(next)
    }

    /// Classify the creating transaction and decide any status that does not
    /// need a spend lookup.
    fn classify_visit(
        &self,
        pending: Pending,
        tx: Option<Arc<TxNode>>,
        tree: &mut TraceTree,
        state: &mut WalkState,
        options: &TraceOptions,
        max_depth: u32,
    ) -> Visit {
        let Some(tx) = tx else {
            return Visit {
                crossings: pending.inherited_crossings,
                pending,
                tx: None,
                crossing: false,
                score: 0,
                protocol: CoinJoinProtocol::None,
                status: Some(NodeStatus::Unresolved),
                spent_by: None,
                spend_unverified: false,
                note: Some("creating transaction not found".into()),
            };
        };

        tree.graph.insert(Arc::clone(&tx));
        let analysis = self.analysis_for(&tx, tree, state, options);
        let crossing = analysis.is_coinjoin(self.detector.threshold());
        let crossings = pending.inherited_crossings + u32::from(crossing);

        let output = tx.output(pending.outpoint.vout);
        let (status, note) = if output.is_none() {
            (
                Some(NodeStatus::Unresolved),
                Some(format!("output index {} does not exist", pending.outpoint.vout)),
            )
        } else if pending.depth >= max_depth {
            (Some(NodeStatus::DepthLimitReached), None)
        } else if matches!(options.coinjoin_stop, CoinJoinStop::AfterCrossings(n) if crossings >= n)
        {
            (Some(NodeStatus::StoppedAtCoinJoin), None)
        } else {
            match tree.direction {
                Direction::Backward if tx.is_coinbase() => (Some(NodeStatus::Coinbase), None),
                Direction::Backward => (None, None),
                Direction::Forward => {
                    if output.is_some_and(|o| o.script_pub_key.is_op_return()) {
                        (Some(NodeStatus::Unspendable), None)
                    } else {
                        (None, None)
                    }
                }
            }
        };

        Visit {
            pending,
            tx: Some(tx),
            crossing,
            crossings,
            score: analysis.score,
            protocol: analysis.protocol,
            status,
            spent_by: None,
            spend_unverified: false,
            note,
        }
    }

    /// Classify once per transaction; merge CIOH evidence after classifying.
    fn analysis_for(
        &self,
        tx: &TxNode,
        tree: &mut TraceTree,
        state: &mut WalkState,
        options: &TraceOptions,
    ) -> CoinJoinAnalysis {
        if let Some(analysis) = state.analyses.get(&tx.txid) {
            return analysis.clone();
        }
        let analysis = self.detector.classify(tx, Some(self.clusters));
        if options.merge_clusters {
            self.clusters
                .merge_transaction(tx, &analysis, self.detector.threshold());
        }
        if analysis.is_coinjoin(self.detector.threshold()) {
            debug!(txid = %tx.txid, score = analysis.score, protocol = ?analysis.protocol, "coinjoin on trace");
            tree.coinjoins.push(CoinJoinHit {
                txid: tx.txid,
                analysis: analysis.clone(),
            });
        }
        state.analyses.insert(tx.txid, analysis.clone());
        analysis
    }

    /// Forward only: resolve spenders for every undecided visit and fetch
    /// the spending transactions, all concurrently.
    async fn resolve_spends(
        &self,
        visits: &mut [Visit],
        tree: &mut TraceTree,
        state: &mut WalkState,
        cancel: &Cancellation,
    ) -> Result<(), (Option<OutPoint>, CoreError)> {
        let open: Vec<usize> = (0..visits.len())
            .filter(|&i| visits[i].status.is_none())
            .collect();
        if open.is_empty() {
            return Ok(());
        }

        let outpoints: Vec<OutPoint> = open.iter().map(|&i| visits[i].pending.outpoint).collect();
        let statuses = cancel
            .run("trace", async {
                Ok(join_all(outpoints.iter().map(|&o| self.gateway.get_spending_tx(o))).await)
            })
            .await
            .map_err(|e| (None, e))?;

        for (&i, status) in open.iter().zip(statuses) {
            let visit = &mut visits[i];
            match status {
                Ok(SpendStatus::Unspent) => visit.status = Some(NodeStatus::Unspent),
                Ok(SpendStatus::Unspendable) => visit.status = Some(NodeStatus::Unspendable),
                Ok(SpendStatus::Spent(spend)) => {
                    visit.spent_by = Some(spend);
                    visit.status = Some(NodeStatus::Spent);
                }
                Err(CoreError::NotIndexed(_)) if !tree.indexer_enabled => {
                    visit.status = Some(NodeStatus::Unspent);
                    visit.spend_unverified = true;
                    state.unverified += 1;
                }
                Err(CoreError::NotIndexed(_)) => {
                    visit.status = Some(NodeStatus::Unresolved);
                    visit.note = Some("indexer does not know the spender".into());
                }
                Err(CoreError::TxNotFound(txid)) => {
                    visit.status = Some(NodeStatus::Unresolved);
                    visit.note = Some(format!("spending candidate {txid} not found"));
                }
                Err(CoreError::SpendScanCapped { scanned, .. }) => {
                    visit.status = Some(NodeStatus::Unresolved);
                    visit.note = Some(format!(
                        "spender not among the first {scanned} history transactions"
                    ));
                    state.scan_capped += 1;
                }
                Err(source) => return Err((Some(visit.pending.outpoint), source)),
            }
        }

        let spenders = unique(
            visits
                .iter()
                .filter(|v| v.status == Some(NodeStatus::Spent))
                .filter_map(|v| v.spent_by.map(|s| s.txid))
                .filter(|txid| !state.expanded.contains(txid)),
        );
        let fetched = cancel
            .run("trace", async {
                Ok(join_all(spenders.iter().map(|t| self.gateway.get_transaction(t))).await)
            })
            .await
            .map_err(|e| (None, e))?;

        for (txid, result) in spenders.iter().zip(fetched) {
            match result {
                Ok(tx) => tree.graph.insert(tx),
                Err(CoreError::TxNotFound(_)) => {
                    for visit in visits
                        .iter_mut()
                        .filter(|v| v.spent_by.map(|s| s.txid) == Some(*txid))
                    {
                        visit.status = Some(NodeStatus::Unresolved);
                        visit.note = Some(format!("spending transaction {txid} not found"));
                    }
                }
                Err(source) => {
                    let failed_at = visits
                        .iter()
                        .find(|v| v.spent_by.map(|s| s.txid) == Some(*txid))
                        .map(|v| v.pending.outpoint);
                    return Err((failed_at, source));
                }
            }
        }
        Ok(())
    }

    /// Append the node and schedule its children.
    fn finalize(
        &self,
        visit: Visit,
        tree: &mut TraceTree,
        state: &mut WalkState,
        options: &TraceOptions,
        next: &mut Vec<Pending>,
    ) {
        let id = tree.nodes.len();
        let pending = &visit.pending;
        let output = visit
            .tx
            .as_ref()
            .and_then(|tx| tx.output(pending.outpoint.vout));

        let status = visit.status.unwrap_or(NodeStatus::Expanded);
        let mut node = TraceNode {
            id,
            parent: pending.parent,
            depth: pending.depth,
            direction: tree.direction,
            outpoint: pending.outpoint,
            value: output.map(|o| o.value).or(pending.known_value),
            address: output
                .and_then(|o| o.address.clone())
                .or_else(|| pending.known_address.clone()),
            block_height: visit.tx.as_ref().and_then(|tx| tx.block_height),
            block_time: visit.tx.as_ref().and_then(|tx| tx.block_time),
            status,
            coinjoin_score: visit.score,
            coinjoin_protocol: visit.protocol,
            coinjoin_crossing: visit.crossing,
            crossings_on_path: visit.crossings,
            spent_by: visit.spent_by,
            converged: false,
            spend_unverified: visit.spend_unverified,
            note: visit.note.clone(),
        };

        // The transaction whose other side we expand into.
        let expand = match status {
            NodeStatus::Expanded => visit.tx.clone(),
            NodeStatus::Spent => visit
                .spent_by
                .and_then(|spend| tree.graph.get(&spend.txid).cloned()),
            _ => None,
        };
        if let Some(spend) = visit.spent_by {
            tree.graph.record_spend(pending.outpoint, spend);
            tree.edges.push(SpendEdge {
                funding_txid: pending.outpoint.txid,
                funding_vout: pending.outpoint.vout,
                spending_txid: spend.txid,
                input_index: spend.input_index,
            });
        }

        if let Some(tx) = expand {
            if !state.expanded.insert(tx.txid) {
                node.converged = true;
            } else {
                let children = self.children_of(&tx, tree.direction, &node);
                for (child, edge) in children {
                    if !state.visited.insert(child.outpoint) {
                        continue;
                    }
                    if state.scheduled >= options.max_nodes {
                        tree.truncated = true;
                        continue;
                    }
                    state.scheduled += 1;
                    if let Some(edge) = edge {
                        tree.edges.push(edge);
                    }
                    next.push(child);
                }
            }
        }

        tree.nodes.push(node);
    }

    fn children_of(
        &self,
        tx: &TxNode,
        direction: Direction,
        node: &TraceNode,
    ) -> Vec<(Pending, Option<SpendEdge>)> {
        match direction {
            Direction::Backward => tx
                .inputs
                .iter()
                .enumerate()
                .filter_map(|(index, input)| {
                    let prevout = input.prevout?;
                    Some((
                        Pending {
                            parent: Some(node.id),
                            outpoint: prevout,
                            depth: node.depth + 1,
                            inherited_crossings: node.crossings_on_path,
                            known_value: input.value,
                            known_address: input.address.clone(),
                        },
                        Some(SpendEdge {
                            funding_txid: prevout.txid,
                            funding_vout: prevout.vout,
                            spending_txid: tx.txid,
                            input_index: index as u32,
                        }),
                    ))
                })
                .collect(),
            Direction::Forward => tx
                .outputs
                .iter()
                .enumerate()
                .map(|(vout, output)| {
                    (
                        Pending {
                            parent: Some(node.id),
                            outpoint: OutPoint::new(tx.txid, vout as u32),
                            depth: node.depth + 1,
                            inherited_crossings: node.crossings_on_path,
                            known_value: Some(output.value),
                            known_address: output.address.clone(),
                        },
                        None,
                    )
                })
                .collect(),
        }
    }

    /// Trace both directions from output 0 of `txid`.
    pub async fn utxo_tree(
        &self,
        txid: Txid,
        forward_depth: u32,
        backward_depth: u32,
        options: &TraceOptions,
        cancel: &Cancellation,
    ) -> Result<UtxoTree, TraceError> {
        validate_depth(forward_depth).map_err(TraceError::early)?;
        validate_depth(backward_depth).map_err(TraceError::early)?;
        let origin = OutPoint::new(txid, 0);
        let backward = self
            .trace(origin, Direction::Backward, backward_depth, options, cancel)
            .await?;
        let forward = self
            .trace(origin, Direction::Forward, forward_depth, options, cancel)
            .await?;

        let mut coinjoin_txids: HashSet<Txid> =
            backward.coinjoins.iter().map(|c| c.txid).collect();
        coinjoin_txids.extend(forward.coinjoins.iter().map(|c| c.txid));
        let summary = UtxoTreeSummary {
            backward_nodes: backward.nodes.len(),
            forward_nodes: forward.nodes.len(),
            coinjoins_found: coinjoin_txids.len(),
            coinbase_origins: backward
                .nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Coinbase)
                .count(),
            unspent_outputs: forward
                .nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Unspent)
                .count(),
        };
        Ok(UtxoTree {
            txid,
            backward,
            forward,
            summary,
        })
    }
}

/// Both-direction view around one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoTree {
    pub txid: Txid,
    pub backward: TraceTree,
    pub forward: TraceTree,
    pub summary: UtxoTreeSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoTreeSummary {
    pub backward_nodes: usize,
    pub forward_nodes: usize,
    pub coinjoins_found: usize,
    pub coinbase_origins: usize,
    pub unspent_outputs: usize,
}

fn unique(txids: impl Iterator<Item = Txid>) -> Vec<Txid> {
    let mut seen = HashSet::new();
    txids.filter(|t| seen.insert(*t)).collect()
}

fn finish_warnings(tree: &mut TraceTree, state: &WalkState) {
    if state.unverified > 0 {
        tree.warnings.push(format!(
            "{} output(s) reported unspent without an address indexer; \
             the node says they were spent but the spender cannot be resolved",
            state.unverified
        ));
    }
    if state.scan_capped > 0 {
        tree.warnings.push(format!(
            "{} output(s) left unresolved because their address history is too busy; \
             raise gateway.spend_scan_limit to search further",
            state.scan_capped
        ));
    }
    if tree.truncated {
        tree.warnings.push(format!(
            "trace truncated at {} nodes; raise max_nodes to see more",
            tree.nodes.len()
        ));
    }
}
