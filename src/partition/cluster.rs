use crate::graph::NodeId;
use log::{debug, info};
use std::collections::{BTreeSet, HashSet};

/// A set of nodes that will end up in the same subgraph. Adjacency is kept at
/// cluster granularity so merge cycle checks never touch the node graph.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub index: usize,
    pub engine: String,
    pub stream_label: Option<String>,
    pub nodes: Vec<NodeId>,
    pub in_clusters: BTreeSet<usize>,
    pub out_clusters: BTreeSet<usize>,
}

#[derive(Clone, Debug)]
enum ClusterEntry {
    Live(Cluster),
    Redirect(usize),
}

/// Arena of clusters with union-find style merging. Merged indices stay valid
/// and resolve to their survivor through at most one redirect hop; redirect
/// targets are rewritten on every merge to keep chains collapsed.
#[derive(Clone, Debug, Default)]
pub struct ClusterSet {
    entries: Vec<ClusterEntry>,
}

impl ClusterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// New singleton cluster holding one node.
    pub fn push(&mut self, engine: String, stream_label: Option<String>, node: NodeId) -> usize {
        let index = self.entries.len();
        self.entries.push(ClusterEntry::Live(Cluster {
            index,
            engine,
            stream_label,
            nodes: vec![node],
            in_clusters: BTreeSet::new(),
            out_clusters: BTreeSet::new(),
        }));
        index
    }

    pub fn resolve(&self, index: usize) -> usize {
        match &self.entries[index] {
            ClusterEntry::Live(_) => index,
            ClusterEntry::Redirect(target) => *target,
        }
    }

    pub fn get(&self, index: usize) -> &Cluster {
        match &self.entries[self.resolve(index)] {
            ClusterEntry::Live(cluster) => cluster,
            // resolve() only ever returns live indices
            ClusterEntry::Redirect(_) => unreachable!(),
        }
    }

    fn get_live_mut(&mut self, index: usize) -> &mut Cluster {
        let resolved = self.resolve(index);
        match &mut self.entries[resolved] {
            ClusterEntry::Live(cluster) => cluster,
            ClusterEntry::Redirect(_) => unreachable!(),
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Cluster> {
        self.entries.iter().filter_map(|e| match e {
            ClusterEntry::Live(cluster) => Some(cluster),
            ClusterEntry::Redirect(_) => None,
        })
    }

    pub fn insert_edge(&mut self, from: usize, to: usize) {
        let from = self.resolve(from);
        let to = self.resolve(to);
        if from == to {
            return;
        }
        self.get_live_mut(from).out_clusters.insert(to);
        self.get_live_mut(to).in_clusters.insert(from);
    }

    pub fn remove_edge(&mut self, from: usize, to: usize) {
        let from = self.resolve(from);
        let to = self.resolve(to);
        self.get_live_mut(from).out_clusters.remove(&to);
        self.get_live_mut(to).in_clusters.remove(&from);
    }

    /// A merge of `parent` into `child` is safe only when no path other than
    /// the direct edge still connects them; otherwise the merged cluster
    /// graph would turn cyclic. The search only expands clusters whose index
    /// is below `upper_bound`: clusters above it were created later in
    /// topological order and cannot lie on a path back into `dst`.
    pub fn has_second_path(&self, src: usize, dst: usize, upper_bound: usize) -> bool {
        let src = self.resolve(src);
        let dst = self.resolve(dst);
        if self.get(src).out_clusters.is_empty() || self.get(dst).in_clusters.is_empty() {
            return false;
        }
        let mut stack = vec![src];
        let mut visited: HashSet<usize> = HashSet::new();
        while let Some(cluster) = stack.pop() {
            if !visited.insert(cluster) {
                continue;
            }
            for &out in &self.get(cluster).out_clusters {
                if out == dst {
                    return true;
                }
                if out < upper_bound {
                    stack.push(out);
                }
            }
        }
        false
    }

    pub fn is_mergeable(&mut self, parent: usize, child: usize, upper_bound: usize) -> bool {
        let parent = self.resolve(parent);
        let child = self.resolve(child);
        if parent == child {
            return false;
        }
        {
            let p = self.get(parent);
            let c = self.get(child);
            if p.nodes.is_empty() || c.nodes.is_empty() {
                return false;
            }
            if p.engine != c.engine || p.stream_label != c.stream_label {
                info!(
                    "cluster {parent} (engine {}, stream {:?}) cannot merge with cluster {child} (engine {}, stream {:?})",
                    p.engine, p.stream_label, c.engine, c.stream_label
                );
                return false;
            }
        }
        self.remove_edge(parent, child);
        let second_path = self.has_second_path(parent, child, upper_bound);
        self.insert_edge(parent, child);
        if second_path {
            info!("second path found between cluster {parent} and cluster {child}, merge rejected");
            return false;
        }
        true
    }

    /// Merges the higher-indexed cluster of the pair into the lower-indexed
    /// one and updates `child` to the surviving index.
    pub fn merge(&mut self, parent: usize, child: &mut usize) {
        let (big, small) = if parent > *child {
            (parent, *child)
        } else {
            (*child, parent)
        };
        *child = small;
        let big = self.resolve(big);
        let small = self.resolve(small);
        if big == small {
            return;
        }
        let big_cluster = match std::mem::replace(&mut self.entries[big], ClusterEntry::Redirect(small)) {
            ClusterEntry::Live(cluster) => cluster,
            ClusterEntry::Redirect(target) => {
                self.entries[big] = ClusterEntry::Redirect(target);
                return;
            }
        };
        // collapse any chains now pointing at the retired index
        for entry in self.entries.iter_mut() {
            if let ClusterEntry::Redirect(target) = entry {
                if *target == big {
                    *target = small;
                }
            }
        }
        let Cluster {
            nodes: big_nodes,
            in_clusters: big_in,
            out_clusters: big_out,
            ..
        } = big_cluster;
        // repoint the retired cluster's neighbors at the survivor
        for &n in big_in.iter().chain(big_out.iter()) {
            if n == big || n == small {
                continue;
            }
            if let ClusterEntry::Live(c) = &mut self.entries[n] {
                if c.out_clusters.remove(&big) {
                    c.out_clusters.insert(small);
                }
                if c.in_clusters.remove(&big) {
                    c.in_clusters.insert(small);
                }
            }
        }
        let survivor = self.get_live_mut(small);
        survivor.nodes.extend(big_nodes);
        survivor.in_clusters.extend(big_in.iter().copied());
        survivor.out_clusters.extend(big_out.iter().copied());
        survivor.in_clusters.remove(&big);
        survivor.in_clusters.remove(&small);
        survivor.out_clusters.remove(&big);
        survivor.out_clusters.remove(&small);
    }

    /// Greedy bottom-up merging pass. Children are visited in creation order
    /// (which follows topological order), parents in ascending successor
    /// count so narrow producers fold in first.
    pub fn coalesce(&mut self) {
        info!("cluster coalescing starts with {} clusters", self.entries.len());
        for child in 0..self.entries.len() {
            let resolved = self.resolve(child);
            let mut parents: Vec<usize> = self.get(resolved).in_clusters.iter().copied().collect();
            parents.sort_by_key(|&p| self.get(p).out_clusters.len());
            let mut merged_child = child;
            for parent in parents {
                if self.is_mergeable(parent, merged_child, child) {
                    self.merge(parent, &mut merged_child);
                    debug!("merged cluster {parent} and cluster {child} into {merged_child}");
                }
            }
        }
        info!("cluster coalescing ends, {} clusters remain", self.live().count());
    }
}
