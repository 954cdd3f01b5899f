//! Directed compute graph with positional data anchors and control edges.
//!
//! Nodes live in a per-graph arena keyed by [`NodeId`]; ids are never reused
//! and stay stable across edge rewiring, so they can be stored in side tables.
//! Every data input anchor accepts at most one incoming edge, output anchors
//! fan out freely.

pub mod op;

use crate::graph::op::{DATA_KIND, OpDesc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node {0:?} does not exist in this graph")]
    UnknownNode(NodeId),
    #[error("{kind} anchor {index} is out of range for node \"{node}\"")]
    AnchorOutOfRange {
        node: String,
        kind: &'static str,
        index: usize,
    },
    #[error("input anchor {index} of node \"{node}\" already has a source")]
    InputOccupied { node: String, index: usize },
    #[error("edge does not exist")]
    EdgeNotFound,
    #[error("graph \"{0}\" contains a cycle")]
    Cycle(String),
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId {
    inner: usize,
}

impl NodeId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

/// One side of a data edge: a node plus an anchor position on it.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: NodeId,
    pub index: usize,
}

impl Endpoint {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    op: OpDesc,
    in_data: Vec<Option<Endpoint>>,
    out_data: Vec<Vec<Endpoint>>,
    in_ctrl: Vec<NodeId>,
    out_ctrl: Vec<NodeId>,
}

impl Node {
    fn new(op: OpDesc) -> Self {
        let in_data = vec![None; op.inputs.len()];
        let out_data = vec![Vec::new(); op.outputs.len()];
        Self {
            op,
            in_data,
            out_data,
            in_ctrl: Vec::new(),
            out_ctrl: Vec::new(),
        }
    }

    pub fn op(&self) -> &OpDesc {
        &self.op
    }

    pub fn op_mut(&mut self) -> &mut OpDesc {
        &mut self.op
    }

    pub fn name(&self) -> &str {
        &self.op.name
    }

    pub fn kind(&self) -> &str {
        &self.op.kind
    }

    pub fn in_data(&self) -> &[Option<Endpoint>] {
        &self.in_data
    }

    pub fn out_data(&self) -> &[Vec<Endpoint>] {
        &self.out_data
    }

    pub fn input_source(&self, index: usize) -> Option<Endpoint> {
        self.in_data.get(index).copied().flatten()
    }

    pub fn output_peers(&self, index: usize) -> &[Endpoint] {
        self.out_data.get(index).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn control_preds(&self) -> &[NodeId] {
        &self.in_ctrl
    }

    pub fn control_succs(&self) -> &[NodeId] {
        &self.out_ctrl
    }

    pub fn has_no_output(&self) -> bool {
        self.out_ctrl.is_empty() && self.out_data.iter().all(|peers| peers.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphAttrs {
    pub session_graph_id: Option<String>,
    pub extra: std::collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComputeGraph {
    name: String,
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    next_node_id: usize,
    pub attrs: GraphAttrs,
}

impl ComputeGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
            next_node_id: 0,
            attrs: GraphAttrs::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Node ids in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn require(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn add_node(&mut self, op: OpDesc) -> NodeId {
        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.insert(id, Node::new(op));
        self.order.push(id);
        id
    }

    /// Detaches the node from every peer and removes it, handing back its op
    /// descriptor so it can be re-added to another graph.
    pub fn remove_node(&mut self, id: NodeId) -> Result<OpDesc, GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let in_srcs: Vec<(usize, Endpoint)> = node
            .in_data
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|e| (i, e)))
            .collect();
        let out_peers: Vec<(usize, Endpoint)> = node
            .out_data
            .iter()
            .enumerate()
            .flat_map(|(i, peers)| peers.iter().map(move |e| (i, *e)))
            .collect();
        let in_ctrl = node.in_ctrl.clone();
        let out_ctrl = node.out_ctrl.clone();
        for (i, src) in in_srcs {
            self.remove_data_edge(src, Endpoint::new(id, i))?;
        }
        for (i, dst) in out_peers {
            self.remove_data_edge(Endpoint::new(id, i), dst)?;
        }
        for src in in_ctrl {
            self.remove_control_edge(src, id)?;
        }
        for dst in out_ctrl {
            self.remove_control_edge(id, dst)?;
        }
        let node = self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))?;
        self.order.retain(|n| *n != id);
        Ok(node.op)
    }

    pub fn add_data_edge(&mut self, src: Endpoint, dst: Endpoint) -> Result<(), GraphError> {
        {
            let s = self
                .nodes
                .get(&src.node)
                .ok_or(GraphError::UnknownNode(src.node))?;
            if src.index >= s.out_data.len() {
                return Err(GraphError::AnchorOutOfRange {
                    node: s.op.name.clone(),
                    kind: "output",
                    index: src.index,
                });
            }
        }
        {
            let d = self
                .nodes
                .get(&dst.node)
                .ok_or(GraphError::UnknownNode(dst.node))?;
            if dst.index >= d.in_data.len() {
                return Err(GraphError::AnchorOutOfRange {
                    node: d.op.name.clone(),
                    kind: "input",
                    index: dst.index,
                });
            }
            if d.in_data[dst.index].is_some() {
                return Err(GraphError::InputOccupied {
                    node: d.op.name.clone(),
                    index: dst.index,
                });
            }
        }
        self.nodes
            .get_mut(&src.node)
            .ok_or(GraphError::UnknownNode(src.node))?
            .out_data[src.index]
            .push(dst);
        self.nodes
            .get_mut(&dst.node)
            .ok_or(GraphError::UnknownNode(dst.node))?
            .in_data[dst.index] = Some(src);
        Ok(())
    }

    pub fn remove_data_edge(&mut self, src: Endpoint, dst: Endpoint) -> Result<(), GraphError> {
        {
            let d = self
                .nodes
                .get(&dst.node)
                .ok_or(GraphError::UnknownNode(dst.node))?;
            if d.in_data.get(dst.index).copied().flatten() != Some(src) {
                return Err(GraphError::EdgeNotFound);
            }
        }
        {
            let s = self
                .nodes
                .get_mut(&src.node)
                .ok_or(GraphError::UnknownNode(src.node))?;
            let peers = s.out_data.get_mut(src.index).ok_or(GraphError::EdgeNotFound)?;
            let pos = peers
                .iter()
                .position(|e| *e == dst)
                .ok_or(GraphError::EdgeNotFound)?;
            peers.remove(pos);
        }
        self.nodes
            .get_mut(&dst.node)
            .ok_or(GraphError::UnknownNode(dst.node))?
            .in_data[dst.index] = None;
        Ok(())
    }

    /// Idempotent: adding an existing control edge is a no-op.
    pub fn add_control_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&dst) {
            return Err(GraphError::UnknownNode(dst));
        }
        {
            let s = self.nodes.get(&src).ok_or(GraphError::UnknownNode(src))?;
            if s.out_ctrl.contains(&dst) {
                return Ok(());
            }
        }
        self.nodes
            .get_mut(&src)
            .ok_or(GraphError::UnknownNode(src))?
            .out_ctrl
            .push(dst);
        self.nodes
            .get_mut(&dst)
            .ok_or(GraphError::UnknownNode(dst))?
            .in_ctrl
            .push(src);
        Ok(())
    }

    pub fn remove_control_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        {
            let s = self.nodes.get_mut(&src).ok_or(GraphError::UnknownNode(src))?;
            let pos = s
                .out_ctrl
                .iter()
                .position(|n| *n == dst)
                .ok_or(GraphError::EdgeNotFound)?;
            s.out_ctrl.remove(pos);
        }
        let d = self.nodes.get_mut(&dst).ok_or(GraphError::UnknownNode(dst))?;
        let pos = d
            .in_ctrl
            .iter()
            .position(|n| *n == src)
            .ok_or(GraphError::EdgeNotFound)?;
        d.in_ctrl.remove(pos);
        Ok(())
    }

    /// All predecessors of the node, data sources first, then control. Edges
    /// are not deduplicated. Unknown ids yield an empty list.
    pub fn in_nodes(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes.get(&id) {
            Some(n) => n
                .in_data
                .iter()
                .flatten()
                .map(|e| e.node)
                .chain(n.in_ctrl.iter().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn out_nodes(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes.get(&id) {
            Some(n) => n
                .out_data
                .iter()
                .flatten()
                .map(|e| e.node)
                .chain(n.out_ctrl.iter().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn input_count(&self) -> usize {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.kind() == DATA_KIND)
            .count()
    }

    pub fn output_count(&self) -> usize {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.has_no_output())
            .count()
    }

    /// Kahn's algorithm. Deterministic for a given insertion order; fails if
    /// the graph is cyclic.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut degree: HashMap<NodeId, usize> = HashMap::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(n) = self.nodes.get(id) {
                let d = n.in_data.iter().filter(|s| s.is_some()).count() + n.in_ctrl.len();
                degree.insert(*id, d);
            }
        }
        let mut queue: VecDeque<NodeId> = self
            .order
            .iter()
            .filter(|id| degree.get(id) == Some(&0))
            .copied()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id);
            if let Some(n) = self.nodes.get(&id) {
                let succs = n
                    .out_data
                    .iter()
                    .flatten()
                    .map(|e| e.node)
                    .chain(n.out_ctrl.iter().copied());
                for succ in succs {
                    if let Some(d) = degree.get_mut(&succ) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(succ);
                        }
                    }
                }
            }
        }
        if sorted.len() != self.order.len() {
            return Err(GraphError::Cycle(self.name.clone()));
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{DType, Format};
    use crate::graph::op::TensorDesc;

    fn op(name: &str, n_in: usize, n_out: usize) -> OpDesc {
        let mut op = OpDesc::new(name, "Test");
        op.inputs = vec![TensorDesc::new(DType::F32, vec![2, 2], Format::ND); n_in];
        op.outputs = vec![TensorDesc::new(DType::F32, vec![2, 2], Format::ND); n_out];
        op
    }

    #[test]
    fn add_and_remove_data_edges() {
        let mut g = ComputeGraph::new("g");
        let a = g.add_node(op("a", 0, 1));
        let b = g.add_node(op("b", 1, 1));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        assert_eq!(g.node(b).unwrap().input_source(0), Some(Endpoint::new(a, 0)));
        assert_eq!(g.node(a).unwrap().output_peers(0), &[Endpoint::new(b, 0)]);

        let err = g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0));
        assert!(matches!(err, Err(GraphError::InputOccupied { .. })));

        g.remove_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        assert_eq!(g.node(b).unwrap().input_source(0), None);
        assert!(matches!(
            g.remove_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)),
            Err(GraphError::EdgeNotFound)
        ));
    }

    #[test]
    fn anchor_range_is_checked() {
        let mut g = ComputeGraph::new("g");
        let a = g.add_node(op("a", 0, 1));
        let b = g.add_node(op("b", 1, 1));
        assert!(matches!(
            g.add_data_edge(Endpoint::new(a, 3), Endpoint::new(b, 0)),
            Err(GraphError::AnchorOutOfRange { .. })
        ));
    }

    #[test]
    fn remove_node_detaches_all_edges() {
        let mut g = ComputeGraph::new("g");
        let a = g.add_node(op("a", 0, 1));
        let b = g.add_node(op("b", 1, 1));
        let c = g.add_node(op("c", 1, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 0), Endpoint::new(c, 0)).unwrap();
        g.add_control_edge(a, c).unwrap();

        let desc = g.remove_node(b).unwrap();
        assert_eq!(desc.name, "b");
        assert_eq!(g.len(), 2);
        assert!(g.node(a).unwrap().output_peers(0).is_empty());
        assert_eq!(g.node(c).unwrap().input_source(0), None);
        assert_eq!(g.node(c).unwrap().control_preds(), &[a]);
    }

    #[test]
    fn control_edges_are_idempotent() {
        let mut g = ComputeGraph::new("g");
        let a = g.add_node(op("a", 0, 1));
        let b = g.add_node(op("b", 1, 0));
        g.add_control_edge(a, b).unwrap();
        g.add_control_edge(a, b).unwrap();
        assert_eq!(g.node(a).unwrap().control_succs(), &[b]);
        g.remove_control_edge(a, b).unwrap();
        assert!(g.node(b).unwrap().control_preds().is_empty());
    }

    #[test]
    fn topological_sort_respects_edges() {
        let mut g = ComputeGraph::new("g");
        let a = g.add_node(op("a", 0, 1));
        let b = g.add_node(op("b", 1, 1));
        let c = g.add_node(op("c", 1, 1));
        let d = g.add_node(op("d", 2, 0));
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(b, 0)).unwrap();
        g.add_data_edge(Endpoint::new(a, 0), Endpoint::new(c, 0)).unwrap();
        g.add_data_edge(Endpoint::new(b, 0), Endpoint::new(d, 0)).unwrap();
        g.add_data_edge(Endpoint::new(c, 0), Endpoint::new(d, 1)).unwrap();

        let order = g.topological_sort().unwrap();
        let pos = |n: NodeId| order.iter().position(|x| *x == n).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    #[test]
    fn topological_sort_detects_cycles() {
        let mut g = ComputeGraph::new("cyclic");
        let a = g.add_node(op("a", 0, 0));
        let b = g.add_node(op("b", 0, 0));
        g.add_control_edge(a, b).unwrap();
        g.add_control_edge(b, a).unwrap();
        assert!(matches!(g.topological_sort(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn node_ids_stay_stable_after_removal() {
        let mut g = ComputeGraph::new("g");
        let a = g.add_node(op("a", 0, 1));
        let b = g.add_node(op("b", 1, 0));
        g.remove_node(a).unwrap();
        let c = g.add_node(op("c", 0, 1));
        assert_ne!(b, c);
        assert!(!g.contains(a));
        let ids: Vec<NodeId> = g.nodes().collect();
        assert_eq!(ids, vec![b, c]);
    }
}
