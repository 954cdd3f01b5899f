//! Partitioning of a compute graph into per-engine subgraphs and the reverse
//! merge once the subgraphs have been optimized independently.
//!
//! Partitioning walks the graph in topological order, grows engine-pure
//! clusters with a cycle-safe greedy merge, splits each cluster into its own
//! subgraph, and stitches every crossing edge with an Exit/Entry node pair
//! recorded in a [`BoundaryTable`]. Input-only nodes (Const/Data/Variable)
//! are drained into a shared rank-0 subgraph so every engine receives its
//! feeds from one place. [`GraphPartitioner::merge`] replays the boundary
//! table to splice the optimized subgraphs back into a single graph.

pub mod cluster;

use crate::graph::op::{ENTRY_KIND, EXIT_KIND, OpDesc, TensorDesc};
use crate::graph::{ComputeGraph, Endpoint, GraphError, NodeId};
use crate::placement::{self, EnginePlacer, PlacementError};
use cluster::ClusterSet;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use strum_macros::Display;

/// Pseudo-engine reserved for input-only nodes.
pub const DEFAULT_DATA_ENGINE: &str = "DEFAULT_DATA";

const INPUT_SUBGRAPH_NAME: &str = "input_nodes";

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error("operation is not allowed in {0} mode")]
    WrongMode(PartitionMode),
    #[error("graph \"{0}\" has no output nodes")]
    NoOutputs(String),
    #[error("boundary table is empty but {0} subgraphs were handed in")]
    MissingBoundaries(usize),
    #[error("boundary pair {0} references a subgraph or node that no longer exists")]
    BrokenPair(u64),
    #[error("partition state is inconsistent: {0}")]
    Corrupted(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Display)]
pub enum PartitionMode {
    Partitioning,
    Merging,
}

/// Everything the partitioner needs from its caller.
pub struct PartitionContext<'a> {
    pub placer: &'a dyn EnginePlacer,
}

/// Location of a boundary node: which subgraph (by rank) and which node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoundaryRef {
    pub subgraph: usize,
    pub node: NodeId,
}

/// One partitioned edge: the Exit in the producer subgraph and the Entry in
/// the consumer subgraph, tied together by the pairing id.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPair {
    pub id: u64,
    pub exit: BoundaryRef,
    pub entry: BoundaryRef,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BoundaryTable {
    pairs: BTreeMap<u64, BoundaryPair>,
}

impl BoundaryTable {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&BoundaryPair> {
        self.pairs.get(&id)
    }

    /// Pairs in ascending pairing id order.
    pub fn pairs(&self) -> impl Iterator<Item = &BoundaryPair> {
        self.pairs.values()
    }

    pub fn entry_of(&self, exit: BoundaryRef) -> Option<BoundaryRef> {
        self.pairs.values().find(|p| p.exit == exit).map(|p| p.entry)
    }

    pub fn exit_of(&self, entry: BoundaryRef) -> Option<BoundaryRef> {
        self.pairs.values().find(|p| p.entry == entry).map(|p| p.exit)
    }

    fn insert(&mut self, pair: BoundaryPair) {
        self.pairs.insert(pair.id, pair);
    }

    fn set_exit(&mut self, id: u64, exit: BoundaryRef) -> bool {
        match self.pairs.get_mut(&id) {
            Some(pair) => {
                pair.exit = exit;
                true
            }
            None => false,
        }
    }

    fn remap(&mut self, positions: &HashMap<usize, usize>) -> Result<(), PartitionError> {
        for (id, pair) in self.pairs.iter_mut() {
            pair.exit.subgraph = *positions
                .get(&pair.exit.subgraph)
                .ok_or(PartitionError::BrokenPair(*id))?;
            pair.entry.subgraph = *positions
                .get(&pair.entry.subgraph)
                .ok_or(PartitionError::BrokenPair(*id))?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.pairs.clear();
    }
}

/// One produced subgraph plus the metadata the engine backends consume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubgraphInfo {
    pub engine: String,
    pub stream_label: Option<String>,
    pub graph: ComputeGraph,
    pub input_flags: Vec<bool>,
    pub output_flags: Vec<bool>,
    pub exits: BTreeMap<NodeId, u64>,
    pub entries: BTreeMap<NodeId, u64>,
    pub rank: usize,
}

#[derive(Debug)]
struct Partition {
    engine: String,
    graph: ComputeGraph,
    retired: bool,
}

enum ExitLink {
    Data {
        src: NodeId,
        out_index: usize,
        exit_index: usize,
    },
    Control {
        src: NodeId,
    },
}

#[derive(Debug)]
pub struct GraphPartitioner {
    mode: PartitionMode,
    boundaries: BoundaryTable,
    next_pairing_id: u64,
    partition_times: u32,
    partitions: Vec<Partition>,
    clusters: ClusterSet,
    node_to_cluster: HashMap<NodeId, usize>,
    cluster_to_partition: HashMap<usize, usize>,
    corresponding: HashMap<NodeId, (usize, NodeId)>,
    input_size: usize,
    output_size: usize,
}

impl Default for GraphPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphPartitioner {
    pub fn new() -> Self {
        Self {
            mode: PartitionMode::Partitioning,
            boundaries: BoundaryTable::default(),
            next_pairing_id: 0,
            partition_times: 0,
            partitions: Vec::new(),
            clusters: ClusterSet::new(),
            node_to_cluster: HashMap::new(),
            cluster_to_partition: HashMap::new(),
            corresponding: HashMap::new(),
            input_size: 0,
            output_size: 0,
        }
    }

    pub fn mode(&self) -> PartitionMode {
        self.mode
    }

    pub fn boundaries(&self) -> &BoundaryTable {
        &self.boundaries
    }

    /// Splits `graph` into engine-pure subgraphs, returned in rank order.
    /// The partitioner then switches to [`PartitionMode::Merging`] until
    /// [`merge`](Self::merge) is called.
    pub fn partition(
        &mut self,
        graph: &mut ComputeGraph,
        ctx: &PartitionContext<'_>,
        mode: PartitionMode,
    ) -> Result<Vec<SubgraphInfo>, PartitionError> {
        self.clear_state(mode);
        info!(
            "graph partition starts for \"{}\" with {} nodes",
            graph.name(),
            graph.len()
        );
        self.input_size = graph.input_count();
        self.output_size = graph.output_count();
        if self.output_size == 0 {
            return Err(PartitionError::NoOutputs(graph.name().to_string()));
        }
        let topo = graph.topological_sort()?;
        self.initialize(graph, ctx, &topo)?;
        self.clusters.coalesce();
        self.split_subgraphs(graph, &topo)?;
        let subgraphs = self.sort_subgraphs(graph, &topo)?;
        self.mode = PartitionMode::Merging;
        self.partition_times = self.partition_times.wrapping_add(1);
        info!(
            "graph partition ends, \"{}\" split into {} subgraphs",
            graph.name(),
            subgraphs.len()
        );
        Ok(subgraphs)
    }

    /// Rebuilds one graph out of the optimized subgraphs by replaying the
    /// boundary table. Consumes the subgraph list; nodes keep their stream
    /// label, inheriting the subgraph-level one when they have none.
    pub fn merge(
        &mut self,
        subgraphs: Vec<SubgraphInfo>,
        ctx: &PartitionContext<'_>,
    ) -> Result<ComputeGraph, PartitionError> {
        if self.mode != PartitionMode::Merging {
            return Err(PartitionError::WrongMode(self.mode));
        }
        info!("graph merge starts with {} subgraphs", subgraphs.len());
        let mut subgraphs = subgraphs;
        subgraphs.sort_by_key(|s| s.rank);

        if self.boundaries.is_empty() {
            // a single partition never got cut apart, hand it back as-is
            if subgraphs.len() != 1 {
                return Err(PartitionError::MissingBoundaries(subgraphs.len()));
            }
            let mut graph = match subgraphs.into_iter().next() {
                Some(sub) => sub.graph,
                None => return Err(PartitionError::MissingBoundaries(0)),
            };
            placement::apply_placement(&mut graph, ctx.placer)?;
            self.clear_state(PartitionMode::Partitioning);
            info!("graph merge ends, single subgraph passed through");
            return Ok(graph);
        }

        let mut merged = ComputeGraph::new("merged_graph");
        match subgraphs.first().and_then(|s| s.graph.attrs.session_graph_id.clone()) {
            Some(session) => {
                debug!("merged graph inherits session id {session}");
                merged.attrs.session_graph_id = Some(session);
            }
            None => warn!("first-ranked subgraph carries no session id"),
        }

        // move the computational nodes over, rank by rank
        let mut remap: HashMap<(usize, NodeId), NodeId> = HashMap::new();
        for (pos, sub) in subgraphs.iter().enumerate() {
            for id in sub.graph.nodes() {
                let node = sub.graph.require(id)?;
                if node.op().is_boundary() {
                    continue;
                }
                let mut op = node.op().clone();
                if op.attrs.stream_label.is_none() {
                    op.attrs.stream_label = sub.stream_label.clone();
                }
                let new_id = merged.add_node(op);
                remap.insert((pos, id), new_id);
            }
        }
        // intra-subgraph edges between surviving nodes
        for (pos, sub) in subgraphs.iter().enumerate() {
            for id in sub.graph.nodes() {
                let node = sub.graph.require(id)?;
                let Some(&dst_new) = remap.get(&(pos, id)) else {
                    continue;
                };
                for (in_index, slot) in node.in_data().iter().enumerate() {
                    if let Some(src) = slot {
                        if let Some(&src_new) = remap.get(&(pos, src.node)) {
                            merged.add_data_edge(
                                Endpoint::new(src_new, src.index),
                                Endpoint::new(dst_new, in_index),
                            )?;
                        }
                    }
                }
                for &src in node.control_preds() {
                    if let Some(&src_new) = remap.get(&(pos, src)) {
                        merged.add_control_edge(src_new, dst_new)?;
                    }
                }
            }
        }
        // splice every boundary pair back into direct edges
        for pair in self.boundaries.pairs() {
            let exit_sub = subgraphs
                .get(pair.exit.subgraph)
                .ok_or(PartitionError::BrokenPair(pair.id))?;
            let entry_sub = subgraphs
                .get(pair.entry.subgraph)
                .ok_or(PartitionError::BrokenPair(pair.id))?;
            let exit_node = exit_sub
                .graph
                .node(pair.exit.node)
                .ok_or(PartitionError::BrokenPair(pair.id))?;
            let entry_node = entry_sub
                .graph
                .node(pair.entry.node)
                .ok_or(PartitionError::BrokenPair(pair.id))?;
            if let Some(src) = exit_node.input_source(0) {
                let Some(&src_new) = remap.get(&(pair.exit.subgraph, src.node)) else {
                    warn!("upstream peer of pair {} was not moved, pair skipped", pair.id);
                    continue;
                };
                let peers = entry_node.output_peers(0).to_vec();
                if peers.is_empty() {
                    warn!("entry of pair {} has no downstream peer, pair skipped", pair.id);
                    continue;
                }
                for peer in peers {
                    let Some(&dst_new) = remap.get(&(pair.entry.subgraph, peer.node)) else {
                        warn!("downstream peer of pair {} was not moved, edge skipped", pair.id);
                        continue;
                    };
                    merged.add_data_edge(
                        Endpoint::new(src_new, src.index),
                        Endpoint::new(dst_new, peer.index),
                    )?;
                }
            } else if let Some(&src) = exit_node.control_preds().first() {
                let Some(&src_new) = remap.get(&(pair.exit.subgraph, src)) else {
                    warn!("upstream peer of pair {} was not moved, pair skipped", pair.id);
                    continue;
                };
                let succs = entry_node.control_succs().to_vec();
                if succs.is_empty() {
                    warn!("entry of pair {} has no downstream peer, pair skipped", pair.id);
                    continue;
                }
                for succ in succs {
                    let Some(&dst_new) = remap.get(&(pair.entry.subgraph, succ)) else {
                        warn!("downstream peer of pair {} was not moved, edge skipped", pair.id);
                        continue;
                    };
                    merged.add_control_edge(src_new, dst_new)?;
                }
            } else {
                warn!("exit of pair {} has no upstream peer, pair skipped", pair.id);
            }
        }

        // the merged graph must be schedulable
        merged.topological_sort()?;
        placement::apply_placement(&mut merged, ctx.placer)?;
        self.clear_state(PartitionMode::Partitioning);
        info!("graph merge ends with {} nodes", merged.len());
        Ok(merged)
    }

    fn clear_state(&mut self, mode: PartitionMode) {
        self.partitions.clear();
        self.clusters = ClusterSet::new();
        self.node_to_cluster.clear();
        self.cluster_to_partition.clear();
        self.corresponding.clear();
        self.boundaries.clear();
        self.input_size = 0;
        self.output_size = 0;
        self.mode = mode;
        // next_pairing_id keeps counting across runs
    }

    /// One singleton cluster per node, in topological order. Input-only
    /// nodes go to the reserved default-data engine, everything else takes
    /// the placer's verdict.
    fn initialize(
        &mut self,
        graph: &mut ComputeGraph,
        ctx: &PartitionContext<'_>,
        topo: &[NodeId],
    ) -> Result<(), PartitionError> {
        let assignments = placement::apply_placement(graph, ctx.placer)?;
        for &node_id in topo {
            let node = graph.require(node_id)?;
            let preds = graph.in_nodes(node_id);
            let engine = if preds.is_empty() && node.op().is_data_like() {
                DEFAULT_DATA_ENGINE.to_string()
            } else {
                assignments
                    .get(&node_id)
                    .cloned()
                    .ok_or_else(|| PlacementError::Unplaced(node.name().to_string()))?
            };
            let stream_label = node.op().attrs.stream_label.clone();
            let index = self.clusters.push(engine, stream_label, node_id);
            self.node_to_cluster.insert(node_id, index);
            for pred in preds {
                let parent = *self.node_to_cluster.get(&pred).ok_or_else(|| {
                    PartitionError::Corrupted(format!(
                        "predecessor {} of node \"{}\" was not clustered",
                        pred.index(),
                        node.name()
                    ))
                })?;
                self.clusters.insert_edge(parent, index);
            }
        }
        debug!("initialized {} singleton clusters", self.clusters.len());
        Ok(())
    }

    fn cluster_of(&self, node: NodeId) -> Result<usize, PartitionError> {
        let raw = self.node_to_cluster.get(&node).ok_or_else(|| {
            PartitionError::Corrupted(format!("node {} was not clustered", node.index()))
        })?;
        Ok(self.clusters.resolve(*raw))
    }

    /// Copies every node into the subgraph of its cluster; edges inside a
    /// cluster are recreated directly, crossing edges become boundary pairs.
    fn split_subgraphs(
        &mut self,
        graph: &ComputeGraph,
        topo: &[NodeId],
    ) -> Result<(), PartitionError> {
        for &node_id in topo {
            let cluster = self.cluster_of(node_id)?;
            let pidx = match self.cluster_to_partition.get(&cluster) {
                Some(p) => *p,
                None => {
                    let pidx = self.partitions.len();
                    let engine = self.clusters.get(cluster).engine.clone();
                    debug!("subgraph {pidx} created for engine {engine}");
                    self.partitions.push(Partition {
                        engine,
                        graph: ComputeGraph::new(format!("subgraph_{pidx}")),
                        retired: false,
                    });
                    self.cluster_to_partition.insert(cluster, pidx);
                    pidx
                }
            };
            let node = graph.require(node_id)?;
            let new_id = self.partitions[pidx].graph.add_node(node.op().clone());
            self.corresponding.insert(node_id, (pidx, new_id));

            for (in_index, slot) in node.in_data().iter().enumerate() {
                let Some(src) = slot else { continue };
                if self.cluster_of(src.node)? == cluster {
                    let &(_, src_new) = self.corresponding.get(&src.node).ok_or_else(|| {
                        PartitionError::Corrupted(format!(
                            "source node {} was not copied",
                            src.node.index()
                        ))
                    })?;
                    self.partitions[pidx].graph.add_data_edge(
                        Endpoint::new(src_new, src.index),
                        Endpoint::new(new_id, in_index),
                    )?;
                } else {
                    self.add_boundary_pair(graph, *src, Endpoint::new(node_id, in_index), true)?;
                }
            }
            for &src in node.control_preds() {
                if self.cluster_of(src)? == cluster {
                    let &(_, src_new) = self.corresponding.get(&src).ok_or_else(|| {
                        PartitionError::Corrupted(format!(
                            "source node {} was not copied",
                            src.index()
                        ))
                    })?;
                    self.partitions[pidx].graph.add_control_edge(src_new, new_id)?;
                } else {
                    self.add_boundary_pair(
                        graph,
                        Endpoint::new(src, 0),
                        Endpoint::new(node_id, 0),
                        false,
                    )?;
                }
            }
        }
        debug!(
            "graph split into {} subgraphs with {} boundary pairs",
            self.partitions.len(),
            self.boundaries.len()
        );
        Ok(())
    }

    /// Cuts the crossing edge `src -> dst` of the original graph: an Exit
    /// node after the copied source, an Entry node before the copied
    /// destination, one shared pairing id.
    fn add_boundary_pair(
        &mut self,
        graph: &ComputeGraph,
        src: Endpoint,
        dst: Endpoint,
        is_data: bool,
    ) -> Result<(), PartitionError> {
        let &(src_pidx, src_new) = self.corresponding.get(&src.node).ok_or_else(|| {
            PartitionError::Corrupted(format!("source node {} was not copied", src.node.index()))
        })?;
        let &(dst_pidx, dst_new) = self.corresponding.get(&dst.node).ok_or_else(|| {
            PartitionError::Corrupted(format!(
                "destination node {} was not copied",
                dst.node.index()
            ))
        })?;
        let src_op = graph.require(src.node)?.op();
        let dst_op = graph.require(dst.node)?.op();
        // descriptors only travel on data edges during a fresh partitioning
        let (exit_desc, entry_desc) = if is_data && self.mode == PartitionMode::Partitioning {
            let out_desc = src_op.outputs.get(src.index).ok_or_else(|| {
                GraphError::AnchorOutOfRange {
                    node: src_op.name.clone(),
                    kind: "output",
                    index: src.index,
                }
            })?;
            let in_desc = dst_op.inputs.get(dst.index).ok_or_else(|| {
                GraphError::AnchorOutOfRange {
                    node: dst_op.name.clone(),
                    kind: "input",
                    index: dst.index,
                }
            })?;
            (
                propagate_desc(out_desc, &src_op.name),
                propagate_desc(in_desc, &dst_op.name),
            )
        } else {
            (TensorDesc::default(), TensorDesc::default())
        };
        let src_kind = src_op.kind.clone();
        let dst_kind = dst_op.kind.clone();
        self.insert_boundary_nodes(
            src_pidx,
            Endpoint::new(src_new, src.index),
            dst_pidx,
            Endpoint::new(dst_new, dst.index),
            &src_kind,
            &dst_kind,
            exit_desc,
            entry_desc,
            is_data,
        )?;
        Ok(())
    }

    /// Materializes an Exit/Entry pair between two subgraphs. Endpoints are
    /// subgraph-local; anchor indices are ignored for control crossings.
    #[allow(clippy::too_many_arguments)]
    fn insert_boundary_nodes(
        &mut self,
        exit_pidx: usize,
        src: Endpoint,
        entry_pidx: usize,
        dst: Endpoint,
        src_kind: &str,
        dst_kind: &str,
        exit_desc: TensorDesc,
        entry_desc: TensorDesc,
        is_data: bool,
    ) -> Result<u64, PartitionError> {
        let id = self.next_pairing_id;
        self.next_pairing_id += 1;

        let exit_graph_name = self.partitions[exit_pidx].graph.name().to_string();
        let mut exit_op = OpDesc::new(format!("{EXIT_KIND}_{id}"), EXIT_KIND);
        exit_op.attrs.pairing_id = Some(id);
        exit_op.attrs.origin_kind = Some(dst_kind.to_string());
        exit_op.inputs = vec![exit_desc.clone()];
        exit_op.outputs = vec![exit_desc];
        let exit_graph = &mut self.partitions[exit_pidx].graph;
        let exit_id = exit_graph.add_node(exit_op);
        if is_data {
            exit_graph.add_data_edge(src, Endpoint::new(exit_id, 0))?;
        } else {
            exit_graph.add_control_edge(src.node, exit_id)?;
        }

        let mut entry_op = OpDesc::new(format!("{ENTRY_KIND}_{id}"), ENTRY_KIND);
        entry_op.attrs.pairing_id = Some(id);
        entry_op.attrs.origin_kind = Some(src_kind.to_string());
        entry_op.attrs.origin_id = Some(format!("{}:{}", exit_graph_name, src.node.index()));
        entry_op.attrs.anchor_index = is_data.then_some(src.index);
        entry_op.inputs = vec![entry_desc.clone()];
        entry_op.outputs = vec![entry_desc];
        let entry_graph = &mut self.partitions[entry_pidx].graph;
        let entry_id = entry_graph.add_node(entry_op);
        if is_data {
            entry_graph.add_data_edge(Endpoint::new(entry_id, 0), dst)?;
        } else {
            entry_graph.add_control_edge(entry_id, dst.node)?;
        }

        self.boundaries.insert(BoundaryPair {
            id,
            exit: BoundaryRef {
                subgraph: exit_pidx,
                node: exit_id,
            },
            entry: BoundaryRef {
                subgraph: entry_pidx,
                node: entry_id,
            },
        });
        debug!("boundary pair {id} inserted between subgraph {exit_pidx} and subgraph {entry_pidx}");
        Ok(id)
    }

    /// Assigns ranks in topological order, drains every default-data
    /// subgraph into the shared input subgraph, renames the graphs and
    /// rewrites the boundary table to rank-based subgraph references.
    fn sort_subgraphs(
        &mut self,
        graph: &ComputeGraph,
        topo: &[NodeId],
    ) -> Result<Vec<SubgraphInfo>, PartitionError> {
        let mut rank_order: Vec<usize> = Vec::new();
        let mut ranked: HashSet<usize> = HashSet::new();
        let mut shared: Option<usize> = None;
        for &node_id in topo {
            let &(pidx, _) = self.corresponding.get(&node_id).ok_or_else(|| {
                PartitionError::Corrupted(format!("node {} was not copied", node_id.index()))
            })?;
            if self.partitions[pidx].engine == DEFAULT_DATA_ENGINE {
                if !self.partitions[pidx].retired {
                    let shared_pidx = match shared {
                        Some(s) => s,
                        None => {
                            let s = self.partitions.len();
                            self.partitions.push(Partition {
                                engine: DEFAULT_DATA_ENGINE.to_string(),
                                graph: ComputeGraph::new(INPUT_SUBGRAPH_NAME),
                                retired: false,
                            });
                            shared = Some(s);
                            s
                        }
                    };
                    self.consolidate_input_partition(pidx, shared_pidx)?;
                    self.partitions[pidx].retired = true;
                    if !self.partitions[pidx].graph.is_empty() {
                        warn!(
                            "subgraph \"{}\" still holds {} nodes after input consolidation",
                            self.partitions[pidx].graph.name(),
                            self.partitions[pidx].graph.len()
                        );
                    }
                }
            } else if ranked.insert(pidx) {
                rank_order.push(pidx);
            }
        }
        if let Some(s) = shared {
            if self.partitions[s].graph.is_empty() {
                warn!("shared input subgraph ended up empty");
            } else {
                rank_order.insert(0, s);
            }
        }

        let positions: HashMap<usize, usize> =
            rank_order.iter().enumerate().map(|(rank, &p)| (p, rank)).collect();
        self.boundaries.remap(&positions)?;

        let session = graph.attrs.session_graph_id.clone();
        if session.is_none() {
            warn!("graph \"{}\" carries no session id", graph.name());
        }
        let mut subgraphs = Vec::with_capacity(rank_order.len());
        for (rank, &pidx) in rank_order.iter().enumerate() {
            let engine = self.partitions[pidx].engine.clone();
            let mut sub =
                std::mem::replace(&mut self.partitions[pidx].graph, ComputeGraph::new("retired"));
            sub.set_name(format!(
                "partition{}_rank{}_{}",
                self.partition_times,
                rank,
                sub.name()
            ));
            if let Some(session) = &session {
                sub.attrs.session_graph_id = Some(session.clone());
            }
            let stream_label = sub
                .nodes()
                .next()
                .and_then(|id| sub.node(id))
                .and_then(|n| n.op().attrs.stream_label.clone());
            let mut exits = BTreeMap::new();
            let mut entries = BTreeMap::new();
            for id in sub.nodes() {
                let node = sub.require(id)?;
                match (node.kind(), node.op().attrs.pairing_id) {
                    (EXIT_KIND, Some(pairing)) => {
                        exits.insert(id, pairing);
                    }
                    (ENTRY_KIND, Some(pairing)) => {
                        entries.insert(id, pairing);
                    }
                    (EXIT_KIND, None) | (ENTRY_KIND, None) => {
                        warn!("boundary node \"{}\" has no pairing id", node.name());
                    }
                    _ => {}
                }
            }
            info!(
                "subgraph \"{}\" assigned rank {rank} on engine {engine}",
                sub.name()
            );
            subgraphs.push(SubgraphInfo {
                engine,
                stream_label,
                graph: sub,
                input_flags: vec![true; self.input_size],
                output_flags: vec![true; self.output_size],
                exits,
                entries,
                rank,
            });
        }
        Ok(subgraphs)
    }

    /// Moves the input-only nodes of one default-data subgraph into the
    /// shared input subgraph. Exit peers travel along; any other peer stays
    /// put and gets a fresh boundary pair instead.
    fn consolidate_input_partition(
        &mut self,
        pidx: usize,
        shared_pidx: usize,
    ) -> Result<(), PartitionError> {
        let data_nodes: Vec<NodeId> = {
            let g = &self.partitions[pidx].graph;
            g.nodes()
                .filter(|id| g.node(*id).map(|n| n.op().is_data_like()).unwrap_or(false))
                .collect()
        };
        for node_id in data_nodes {
            let (out_edges, out_ctrl) = {
                let node = self.partitions[pidx].graph.require(node_id)?;
                let out_edges: Vec<(usize, Endpoint)> = node
                    .out_data()
                    .iter()
                    .enumerate()
                    .flat_map(|(i, peers)| peers.iter().map(move |e| (i, *e)))
                    .collect();
                (out_edges, node.control_succs().to_vec())
            };
            let op = self.partitions[pidx].graph.remove_node(node_id)?;
            debug!("input node \"{}\" moved into the shared subgraph", op.name);
            let new_data = self.partitions[shared_pidx].graph.add_node(op);

            for (out_index, peer) in out_edges {
                if self.partitions[pidx].graph.require(peer.node)?.kind() == EXIT_KIND {
                    self.relocate_exit(
                        pidx,
                        shared_pidx,
                        peer.node,
                        ExitLink::Data {
                            src: new_data,
                            out_index,
                            exit_index: peer.index,
                        },
                    )?;
                } else {
                    // consumer stays behind, bridge the edge with a new pair
                    let (src_kind, exit_desc) = {
                        let src_op = self.partitions[shared_pidx].graph.require(new_data)?.op();
                        let out_desc = src_op.outputs.get(out_index).ok_or_else(|| {
                            GraphError::AnchorOutOfRange {
                                node: src_op.name.clone(),
                                kind: "output",
                                index: out_index,
                            }
                        })?;
                        (src_op.kind.clone(), propagate_desc(out_desc, &src_op.name))
                    };
                    let (dst_kind, entry_desc) = {
                        let dst_node = self.partitions[pidx].graph.require(peer.node)?;
                        let in_desc = dst_node.op().inputs.get(peer.index).ok_or_else(|| {
                            GraphError::AnchorOutOfRange {
                                node: dst_node.name().to_string(),
                                kind: "input",
                                index: peer.index,
                            }
                        })?;
                        (
                            dst_node.kind().to_string(),
                            propagate_desc(in_desc, dst_node.name()),
                        )
                    };
                    self.insert_boundary_nodes(
                        shared_pidx,
                        Endpoint::new(new_data, out_index),
                        pidx,
                        peer,
                        &src_kind,
                        &dst_kind,
                        exit_desc,
                        entry_desc,
                        true,
                    )?;
                }
            }
            for succ in out_ctrl {
                if self.partitions[pidx].graph.require(succ)?.kind() == EXIT_KIND {
                    self.relocate_exit(pidx, shared_pidx, succ, ExitLink::Control { src: new_data })?;
                } else {
                    let src_kind = self
                        .partitions[shared_pidx]
                        .graph
                        .require(new_data)?
                        .kind()
                        .to_string();
                    let dst_kind = self.partitions[pidx].graph.require(succ)?.kind().to_string();
                    self.insert_boundary_nodes(
                        shared_pidx,
                        Endpoint::new(new_data, 0),
                        pidx,
                        Endpoint::new(succ, 0),
                        &src_kind,
                        &dst_kind,
                        TensorDesc::default(),
                        TensorDesc::default(),
                        false,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn relocate_exit(
        &mut self,
        from: usize,
        to: usize,
        exit: NodeId,
        link: ExitLink,
    ) -> Result<(), PartitionError> {
        let op = self.partitions[from].graph.remove_node(exit)?;
        let pairing = op.attrs.pairing_id;
        let new_exit = self.partitions[to].graph.add_node(op);
        match link {
            ExitLink::Data {
                src,
                out_index,
                exit_index,
            } => {
                self.partitions[to].graph.add_data_edge(
                    Endpoint::new(src, out_index),
                    Endpoint::new(new_exit, exit_index),
                )?;
            }
            ExitLink::Control { src } => {
                self.partitions[to].graph.add_control_edge(src, new_exit)?;
            }
        }
        match pairing {
            Some(id) => {
                if !self.boundaries.set_exit(
                    id,
                    BoundaryRef {
                        subgraph: to,
                        node: new_exit,
                    },
                ) {
                    warn!("pairing id {id} unknown while relocating an exit node");
                }
            }
            None => warn!("exit node without pairing id relocated"),
        }
        Ok(())
    }
}

/// Copy of a tensor descriptor for a boundary node, falling back to the
/// origin dtype/format when the current ones are undefined.
fn propagate_desc(desc: &TensorDesc, owner: &str) -> TensorDesc {
    let dtype = desc.dtype.or(desc.origin_dtype);
    if dtype.is_none() {
        warn!("both data types of \"{owner}\" are undefined");
    }
    let (format, shape) = match (desc.format, desc.origin_format) {
        (Some(format), _) => (Some(format), desc.shape.clone()),
        (None, Some(format)) => (Some(format), desc.origin_shape.clone()),
        (None, None) => {
            warn!("both formats of \"{owner}\" are undefined");
            (None, desc.shape.clone())
        }
    };
    TensorDesc {
        dtype,
        shape: shape.clone(),
        format,
        origin_dtype: dtype,
        origin_format: format,
        origin_shape: shape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{DType, Format};
    use crate::graph::op::{CONST_KIND, DATA_KIND};
    use crate::placement::NameMapPlacer;
    use std::collections::BTreeSet;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn op(name: &str, kind: &str, n_in: usize, n_out: usize) -> OpDesc {
        let mut op = OpDesc::new(name, kind);
        op.inputs = vec![TensorDesc::new(DType::F32, vec![1, 4], Format::ND); n_in];
        op.outputs = vec![TensorDesc::new(DType::F32, vec![1, 4], Format::ND); n_out];
        op
    }

    fn kinds(graph: &ComputeGraph) -> Vec<String> {
        let mut kinds: Vec<String> = graph
            .nodes()
            .filter_map(|id| graph.node(id))
            .map(|n| n.kind().to_string())
            .collect();
        kinds.sort();
        kinds
    }

    fn data_edges(graph: &ComputeGraph) -> BTreeSet<(String, usize, String, usize)> {
        let mut edges = BTreeSet::new();
        for id in graph.nodes() {
            let node = graph.node(id).unwrap();
            for (in_index, slot) in node.in_data().iter().enumerate() {
                if let Some(src) = slot {
                    let src_name = graph.node(src.node).unwrap().name().to_string();
                    edges.insert((src_name, src.index, node.name().to_string(), in_index));
                }
            }
        }
        edges
    }

    fn ctrl_edges(graph: &ComputeGraph) -> BTreeSet<(String, String)> {
        let mut edges = BTreeSet::new();
        for id in graph.nodes() {
            let node = graph.node(id).unwrap();
            for succ in node.control_succs() {
                let succ_name = graph.node(*succ).unwrap().name().to_string();
                edges.insert((node.name().to_string(), succ_name));
            }
        }
        edges
    }

    #[test]
    fn same_engine_chain_stays_whole() {
        init_logs();
        let mut g = ComputeGraph::new("chain");
        g.attrs.session_graph_id = Some("session_0".to_string());
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 1));
        let c = g.add_node(op("c", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 0), Endpoint::new(c, 0)).unwrap();

        let placer = NameMapPlacer::with_default("X");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();

        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].engine, "X");
        assert_eq!(subs[0].rank, 0);
        assert_eq!(subs[0].graph.len(), 3);
        assert!(subs[0].exits.is_empty());
        assert!(subs[0].entries.is_empty());
        assert!(partitioner.boundaries().is_empty());
        assert_eq!(partitioner.mode(), PartitionMode::Merging);
        assert!(subs[0].graph.attrs.session_graph_id.is_some());

        let merged = partitioner.merge(subs, &ctx).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(partitioner.mode(), PartitionMode::Partitioning);
    }

    #[test]
    fn cross_engine_edge_gets_boundary_pair() {
        let mut g = ComputeGraph::new("cross");
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();

        let placer = NameMapPlacer::new().assign("a", "X").assign("b", "Y");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();

        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].engine, "X");
        assert_eq!(subs[1].engine, "Y");
        assert_eq!(kinds(&subs[0].graph), vec![EXIT_KIND.to_string(), "Source".to_string()]);
        assert_eq!(kinds(&subs[1].graph), vec![ENTRY_KIND.to_string(), "Relu".to_string()]);
        assert_eq!(subs[0].exits.len(), 1);
        assert_eq!(subs[1].entries.len(), 1);

        // both halves agree on the pairing id
        let (&exit_id, &pairing) = subs[0].exits.iter().next().unwrap();
        assert_eq!(subs[1].entries.values().next(), Some(&pairing));
        let pair = partitioner.boundaries().get(pairing).unwrap();
        assert_eq!(pair.exit, BoundaryRef { subgraph: 0, node: exit_id });
        assert_eq!(
            partitioner.boundaries().entry_of(pair.exit),
            Some(pair.entry)
        );
        assert_eq!(partitioner.boundaries().exit_of(pair.entry), Some(pair.exit));

        // descriptor and provenance travel onto the boundary nodes
        let entry = subs[1].graph.node(pair.entry.node).unwrap();
        assert_eq!(entry.op().inputs[0].dtype, Some(DType::F32));
        assert_eq!(entry.op().inputs[0].shape, vec![1, 4]);
        assert_eq!(entry.op().attrs.origin_kind.as_deref(), Some("Source"));
        assert_eq!(entry.op().attrs.anchor_index, Some(0));
        let exit = subs[0].graph.node(pair.exit.node).unwrap();
        assert_eq!(exit.op().attrs.origin_kind.as_deref(), Some("Relu"));
    }

    #[test]
    fn merging_mode_resplit_keeps_placeholder_descriptors() {
        init_logs();
        let placer = NameMapPlacer::new().assign("a", "X").assign("b", "Y");
        let ctx = PartitionContext { placer: &placer };
        let cross = || {
            let mut g = ComputeGraph::new("cross");
            let a = g.add_node(op("a", "Source", 0, 1));
            let b = g.add_node(op("b", "Relu", 1, 0));
            g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
            g
        };

        let mut partitioner = GraphPartitioner::new();
        let mut g = cross();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();
        let pair = partitioner.boundaries().pairs().next().unwrap().clone();
        let entry = subs[1].graph.node(pair.entry.node).unwrap();
        assert_eq!(entry.op().inputs[0].dtype, Some(DType::F32));

        // a re-split during merging must not touch the boundary descriptors
        let mut g = cross();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Merging)
            .unwrap();
        let pair = partitioner.boundaries().pairs().next().unwrap().clone();
        let exit = subs[0].graph.node(pair.exit.node).unwrap();
        let entry = subs[1].graph.node(pair.entry.node).unwrap();
        assert_eq!(exit.op().inputs[0], TensorDesc::default());
        assert_eq!(exit.op().outputs[0], TensorDesc::default());
        assert_eq!(entry.op().inputs[0], TensorDesc::default());
        assert_eq!(entry.op().outputs[0], TensorDesc::default());
        // provenance attributes still travel regardless of mode
        assert_eq!(entry.op().attrs.origin_kind.as_deref(), Some("Source"));
        assert_eq!(entry.op().attrs.anchor_index, Some(0));
    }

    #[test]
    fn subgraphs_are_engine_pure() {
        let mut g = ComputeGraph::new("mixed");
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 1));
        let c = g.add_node(op("c", "Relu", 1, 1));
        let d = g.add_node(op("d", "Add", 2, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(c, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 0), Endpoint::new(d, 0)).unwrap();
        g.add_data_edge(Endpoint::new(c, 0), Endpoint::new(d, 1)).unwrap();

        let placer = NameMapPlacer::with_default("X").assign("c", "Y");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();

        for sub in &subs {
            let engines: BTreeSet<String> = sub
                .graph
                .nodes()
                .filter_map(|id| sub.graph.node(id))
                .filter(|n| !n.op().is_boundary())
                .filter_map(|n| n.op().attrs.engine.clone())
                .collect();
            assert!(engines.len() <= 1, "subgraph {} mixes engines", sub.rank);
        }
    }

    #[test]
    fn input_nodes_are_consolidated_at_rank_zero() {
        init_logs();
        let mut g = ComputeGraph::new("consts");
        let k = g.add_node(op("k", CONST_KIND, 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 0));
        let c = g.add_node(op("c", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(k, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(k, 0), Endpoint::new(c, 0)).unwrap();

        let placer = NameMapPlacer::new().assign("b", "X").assign("c", "Y");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();

        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].rank, 0);
        assert_eq!(subs[0].engine, DEFAULT_DATA_ENGINE);
        assert_eq!(
            kinds(&subs[0].graph),
            vec![CONST_KIND.to_string(), EXIT_KIND.to_string(), EXIT_KIND.to_string()]
        );
        assert_eq!(subs[1].entries.len(), 1);
        assert_eq!(subs[2].entries.len(), 1);
        assert!(subs[0].graph.name().contains("rank0"));

        let merged = partitioner.merge(subs, &ctx).unwrap();
        assert_eq!(merged.len(), 3);
        let expected: BTreeSet<_> = [
            ("k".to_string(), 0, "b".to_string(), 0),
            ("k".to_string(), 0, "c".to_string(), 0),
        ]
        .into_iter()
        .collect();
        assert_eq!(data_edges(&merged), expected);
    }

    #[test]
    fn partition_then_merge_round_trips() {
        init_logs();
        let mut g = ComputeGraph::new("round_trip");
        g.attrs.session_graph_id = Some("session_7".to_string());
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 2));
        let c = g.add_node(op("c", "Relu", 1, 0));
        let d = g.add_node(op("d", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 0), Endpoint::new(c, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 1), Endpoint::new(d, 0)).unwrap();
        g.add_control_edge(a, d).unwrap();

        let original_edges = data_edges(&g);
        let original_ctrl = ctrl_edges(&g);
        let placer = NameMapPlacer::with_default("X").assign("c", "Y").assign("d", "Y");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();
        assert!(subs.len() >= 2);

        let merged = partitioner.merge(subs, &ctx).unwrap();
        assert_eq!(merged.len(), 4);
        assert_eq!(data_edges(&merged), original_edges);
        assert_eq!(ctrl_edges(&merged), original_ctrl);
        assert_eq!(merged.attrs.session_graph_id.as_deref(), Some("session_7"));
        merged.topological_sort().unwrap();
        // no boundary kinds may survive the merge
        assert!(!kinds(&merged).iter().any(|k| k == EXIT_KIND || k == ENTRY_KIND));
    }

    #[test]
    fn merge_without_partition_is_rejected() {
        let placer = NameMapPlacer::with_default("X");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let err = partitioner.merge(Vec::new(), &ctx);
        assert!(matches!(err, Err(PartitionError::WrongMode(_))));
    }

    #[test]
    fn unplaced_node_fails_partitioning() {
        let mut g = ComputeGraph::new("unplaced");
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();

        let placer = NameMapPlacer::new().assign("a", "X");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let err = partitioner.partition(&mut g, &ctx, PartitionMode::Partitioning);
        assert!(matches!(err, Err(PartitionError::Placement(_))));
    }

    #[test]
    fn cyclic_graph_fails_partitioning() {
        let mut g = ComputeGraph::new("cyclic");
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 1));
        let c = g.add_node(op("c", "Relu", 0, 0));
        let d = g.add_node(op("d", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 0), Endpoint::new(d, 0)).unwrap();
        g.add_control_edge(b, c).unwrap();
        g.add_control_edge(c, b).unwrap();

        let placer = NameMapPlacer::with_default("X");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let err = partitioner.partition(&mut g, &ctx, PartitionMode::Partitioning);
        assert!(matches!(err, Err(PartitionError::Graph(GraphError::Cycle(_)))));
    }

    #[test]
    fn data_inputs_get_the_default_data_engine() {
        let mut g = ComputeGraph::new("inputs");
        let d = g.add_node(op("in0", DATA_KIND, 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(d, 0), Endpoint::new(b, 0)).unwrap();

        // no assignment for the Data node on purpose
        let placer = NameMapPlacer::new().assign("b", "X");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();
        assert_eq!(subs[0].engine, DEFAULT_DATA_ENGINE);
        assert_eq!(subs[0].input_flags, vec![true]);
    }

    #[test]
    fn pairing_ids_keep_counting_across_runs() {
        let placer = NameMapPlacer::new().assign("a", "X").assign("b", "Y");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let mut max_pairing = 0;
        for run in 0..2 {
            let mut g = ComputeGraph::new(format!("run_{run}"));
            let a = g.add_node(op("a", "Source", 0, 1));
            let b = g.add_node(op("b", "Relu", 1, 0));
            g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
            let subs = partitioner
                .partition(&mut g, &ctx, PartitionMode::Partitioning)
                .unwrap();
            let pairing = *subs[0].exits.values().next().unwrap();
            assert!(run == 0 || pairing > max_pairing);
            max_pairing = pairing;
            partitioner.merge(subs, &ctx).unwrap();
        }
    }

    #[test]
    fn subgraph_info_serializes() {
        let mut g = ComputeGraph::new("serde");
        let a = g.add_node(op("a", "Source", 0, 1));
        let b = g.add_node(op("b", "Relu", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        let placer = NameMapPlacer::with_default("X");
        let ctx = PartitionContext { placer: &placer };
        let mut partitioner = GraphPartitioner::new();
        let subs = partitioner
            .partition(&mut g, &ctx, PartitionMode::Partitioning)
            .unwrap();
        let desc = subs[0]
            .graph
            .nodes()
            .filter_map(|id| subs[0].graph.node(id))
            .find(|n| n.name() == "a")
            .unwrap()
            .op()
            .clone();
        let json = serde_json::to_string(&desc).unwrap();
        let back: OpDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
