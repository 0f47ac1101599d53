//! Address clustering under the common-input-ownership heuristic.
//!
//! A process-wide union-find over address strings. Clusters only ever grow:
//! there is no split or delete. All state sits behind one
//! `parking_lot::Mutex`; merges are rare relative to lookups and every
//! operation is a handful of array accesses.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coinjoin::CoinJoinAnalysis;
use crate::error::CoreError;
use crate::types::TxNode;

/// Identifier of a cluster: the index of its union-find root. Only stable
/// until the next merge touching the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub usize);

/// Cluster description returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: ClusterId,
    /// Address at the union-find root.
    pub representative: String,
    pub size: usize,
}

/// What `merge_transaction` did with a transaction's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MergeOutcome {
    /// Inputs were unioned; `cluster` is the resulting root.
    Merged { cluster: ClusterId, addresses: usize },
    /// Score at or above the threshold: CIOH does not hold for mixes.
    SkippedCoinJoin,
    /// Fewer than two distinct input addresses were resolved.
    NothingToMerge,
}

#[derive(Debug, Default)]
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
    addresses: Vec<String>,
    index: HashMap<String, usize>,
}

impl UnionFind {
    fn intern(&mut self, address: &str) -> usize {
        if let Some(&i) = self.index.get(address) {
            return i;
        }
        let i = self.parent.len();
        self.parent.push(i);
        self.size.push(1);
        self.addresses.push(address.to_owned());
        self.index.insert(address.to_owned(), i);
        i
    }

    fn root(&mut self, mut i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression.
        while self.parent[i] != root {
            let next = self.parent[i];
            self.parent[i] = root;
            i = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.root(a), self.root(b));
        if ra == rb {
            return ra;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        big
    }
}

/// Serializable form of the clustering state: one member list per cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub clusters: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct ClusterStore {
    inner: Mutex<UnionFind>,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union all `addresses` into one cluster. Unknown addresses are
    /// registered first. Returns the resulting root, or `None` for an empty
    /// slice.
    pub fn merge<S: AsRef<str>>(&self, addresses: &[S]) -> Option<ClusterId> {
        let mut uf = self.inner.lock();
        let mut iter = addresses.iter();
        let first = uf.intern(iter.next()?.as_ref());
        let mut root = uf.root(first);
        for address in iter {
            let i = uf.intern(address.as_ref());
            root = uf.union(root, i);
        }
        Some(ClusterId(root))
    }

    /// Cluster of `address`, registering it as a singleton if unseen.
    pub fn find(&self, address: &str) -> ClusterId {
        let mut uf = self.inner.lock();
        let i = uf.intern(address);
        ClusterId(uf.root(i))
    }

    /// Cluster of `address` without registering it.
    pub fn lookup(&self, address: &str) -> Option<ClusterId> {
        let mut uf = self.inner.lock();
        let i = *uf.index.get(address)?;
        Some(ClusterId(uf.root(i)))
    }

    /// Size of the cluster rooted at `id`. Non-root or unknown ids report 0.
    pub fn size(&self, id: ClusterId) -> usize {
        let uf = self.inner.lock();
        match uf.parent.get(id.0) {
            Some(&p) if p == id.0 => uf.size[id.0],
            _ => 0,
        }
    }

    /// Size of the cluster containing `address`; 1 for unseen addresses.
    pub fn cluster_size_of(&self, address: &str) -> usize {
        self.lookup(address).map_or(1, |id| self.size(id))
    }

    pub fn cluster_of(&self, address: &str) -> ClusterInfo {
        let mut uf = self.inner.lock();
        let i = uf.intern(address);
        let root = uf.root(i);
        ClusterInfo {
            id: ClusterId(root),
            representative: uf.addresses[root].clone(),
            size: uf.size[root],
        }
    }

    /// Sorted member addresses of the cluster containing `address`.
    pub fn members(&self, address: &str) -> Vec<String> {
        let mut uf = self.inner.lock();
        let Some(&i) = uf.index.get(address) else {
            return vec![address.to_owned()];
        };
        let target = uf.root(i);
        let mut members = Vec::new();
        for j in 0..uf.parent.len() {
            if uf.root(j) == target {
                members.push(uf.addresses[j].clone());
            }
        }
        members.sort();
        members
    }

    /// Number of distinct clusters among `addresses`; unseen addresses count
    /// as their own singleton cluster.
    pub fn distinct_clusters(&self, addresses: &[&str]) -> usize {
        let mut uf = self.inner.lock();
        let mut roots = HashSet::new();
        let mut unseen = HashSet::new();
        for address in addresses {
            match uf.index.get(*address).copied() {
                Some(i) => {
                    roots.insert(uf.root(i));
                }
                None => {
                    unseen.insert(*address);
                }
            }
        }
        roots.len() + unseen.len()
    }

    /// Apply CIOH to `tx`. The caller must classify first; transactions
    /// whose CoinJoin score reaches `threshold` are never merged.
    pub fn merge_transaction(
        &self,
        tx: &TxNode,
        analysis: &CoinJoinAnalysis,
        threshold: u8,
    ) -> MergeOutcome {
        if analysis.is_coinjoin(threshold) {
            debug!(txid = %tx.txid, score = analysis.score, "skipping CIOH merge for coinjoin");
            return MergeOutcome::SkippedCoinJoin;
        }
        let addresses = tx.input_addresses();
        if addresses.len() < 2 {
            return MergeOutcome::NothingToMerge;
        }
        match self.merge(addresses.as_slice()) {
            Some(cluster) => MergeOutcome::Merged {
                cluster,
                addresses: addresses.len(),
            },
            None => MergeOutcome::NothingToMerge,
        }
    }

    /// Number of addresses known to the store.
    pub fn address_count(&self) -> usize {
        self.inner.lock().parent.len()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let mut uf = self.inner.lock();
        let mut groups: HashMap<usize, Vec<String>> = HashMap::new();
        for i in 0..uf.parent.len() {
            let root = uf.root(i);
            groups.entry(root).or_default().push(uf.addresses[i].clone());
        }
        let mut clusters: Vec<Vec<String>> = groups
            .into_values()
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        clusters.sort();
        ClusterSnapshot { clusters }
    }

    /// Merge a snapshot into the current state. Existing clusters are kept;
    /// hydration can only grow them.
    pub fn hydrate(&self, snapshot: &ClusterSnapshot) {
        for members in &snapshot.clusters {
            self.merge(members.as_slice());
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(&self.snapshot())
            .map_err(|e| CoreError::Config(format!("encode cluster snapshot: {e}")))
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let snapshot: ClusterSnapshot = serde_json::from_str(raw)
            .map_err(|e| CoreError::Config(format!("decode cluster snapshot: {e}")))?;
        let store = Self::new();
        store.hydrate(&snapshot);
        Ok(store)
    }
}
