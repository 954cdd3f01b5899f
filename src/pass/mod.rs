//! Fixed-point node pass scheduling.
//!
//! [`PassScheduler`] visits every node of a graph once in data-flow order and
//! runs a pipeline of [`NodePass`]es on it. Passes may rewrite the graph
//! while running: they report deleted nodes (which are never visited again)
//! and nodes that need another visit, and the scheduler keeps draining the
//! re-pass set until it reaches a fixed point or gives up after a bounded
//! number of rounds.

use crate::graph::{ComputeGraph, Endpoint, GraphError, NodeId};
use log::{debug, error, info, warn};
use std::collections::{HashSet, VecDeque};

/// Rounds of re-pass draining before the scheduler stops making progress.
const MAX_SCHEDULE_ROUNDS: usize = 1000;
/// Nodes with more predecessors than this are deferred to the end of the
/// first round instead of being readiness-checked on every edge.
const DEFERRED_FAN_IN: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("no passes registered")]
    EmptyPipeline,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{0}")]
    Failure(String),
}

/// One rewrite rule applied to a single node at a time.
pub trait NodePass {
    /// Called before every `run`.
    fn init(&mut self) -> Result<(), PassError> {
        Ok(())
    }

    fn run(&mut self, graph: &mut ComputeGraph, node: NodeId) -> Result<(), PassError>;

    /// Nodes this pass wants visited again.
    fn nodes_need_repass(&self) -> HashSet<NodeId> {
        HashSet::new()
    }

    /// Nodes this pass removed from the graph.
    fn nodes_deleted(&self) -> HashSet<NodeId> {
        HashSet::new()
    }

    /// Called after the reports above were collected.
    fn reset(&mut self) {}
}

/// Bookkeeping helper for passes: collects re-pass and deletion reports and
/// implements the common isolate-and-delete rewrite.
#[derive(Debug, Default)]
pub struct PassRecorder {
    repass: HashSet<NodeId>,
    deleted: HashSet<NodeId>,
}

impl PassRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repass(&mut self, node: NodeId) {
        self.repass.insert(node);
    }

    pub fn add_deleted(&mut self, node: NodeId) {
        self.deleted.insert(node);
    }

    pub fn repass(&self) -> &HashSet<NodeId> {
        &self.repass
    }

    pub fn deleted(&self) -> &HashSet<NodeId> {
        &self.deleted
    }

    pub fn clear(&mut self) {
        self.repass.clear();
        self.deleted.clear();
    }

    /// Removes `node` from the graph after rerouting its consumers. Every
    /// `(input, output)` entry of `io_map` reconnects the peers of that
    /// output anchor to the source feeding that input anchor; unmapped
    /// consumers lose their edge with the node. All former neighbors are
    /// marked for re-pass.
    pub fn isolate_and_delete_node(
        &mut self,
        graph: &mut ComputeGraph,
        node: NodeId,
        io_map: &[(usize, usize)],
    ) -> Result<(), PassError> {
        {
            let n = graph.require(node)?;
            info!("isolating node \"{}\" ({})", n.name(), n.kind());
        }
        for pred in graph.in_nodes(node) {
            self.repass.insert(pred);
        }
        for succ in graph.out_nodes(node) {
            self.repass.insert(succ);
        }
        for &(in_index, out_index) in io_map {
            let (src, peers) = {
                let n = graph.require(node)?;
                if in_index >= n.in_data().len() {
                    return Err(PassError::Graph(GraphError::AnchorOutOfRange {
                        node: n.name().to_string(),
                        kind: "input",
                        index: in_index,
                    }));
                }
                if out_index >= n.out_data().len() {
                    return Err(PassError::Graph(GraphError::AnchorOutOfRange {
                        node: n.name().to_string(),
                        kind: "output",
                        index: out_index,
                    }));
                }
                (n.input_source(in_index), n.output_peers(out_index).to_vec())
            };
            let Some(src) = src else {
                // unconnected input anchors cannot feed anyone
                continue;
            };
            for peer in peers {
                graph.remove_data_edge(Endpoint::new(node, out_index), peer)?;
                graph.add_data_edge(src, peer)?;
            }
        }
        graph.remove_node(node)?;
        self.deleted.insert(node);
        Ok(())
    }
}

fn all_preds_seen(graph: &ComputeGraph, node: NodeId, seen: &HashSet<NodeId>) -> bool {
    graph.in_nodes(node).iter().all(|p| seen.contains(p))
}

fn run_passes(
    graph: &mut ComputeGraph,
    node: NodeId,
    passes: &mut [(&str, &mut dyn NodePass)],
    repass: &mut HashSet<NodeId>,
    deleted: &mut HashSet<NodeId>,
    seen: &HashSet<NodeId>,
) -> Result<(), PassError> {
    debug!("running passes for node {}", node.index());
    for (name, pass) in passes.iter_mut() {
        pass.init()?;
        if let Err(e) = pass.run(graph, node) {
            error!("pass \"{name}\" failed on node {}: {e}", node.index());
            return Err(e);
        }
        for requested in pass.nodes_need_repass() {
            if all_preds_seen(graph, requested, seen) {
                debug!("node {} scheduled for re-pass", requested.index());
                repass.insert(requested);
            } else {
                debug!(
                    "node {} has unseen predecessors, re-pass not scheduled this round",
                    requested.index()
                );
            }
        }
        let reported = pass.nodes_deleted();
        let node_deleted = reported.contains(&node);
        deleted.extend(reported);
        pass.reset();
        if node_deleted {
            debug!(
                "node {} deleted by pass \"{name}\", remaining passes skipped",
                node.index()
            );
            break;
        }
    }
    Ok(())
}

pub struct PassScheduler<'a> {
    graph: &'a mut ComputeGraph,
}

impl<'a> PassScheduler<'a> {
    pub fn new(graph: &'a mut ComputeGraph) -> Self {
        Self { graph }
    }

    /// Runs the pipeline to a fixed point. The first failing pass aborts the
    /// whole run; exhausting the round budget only logs a warning.
    pub fn run(&mut self, passes: &mut [(&str, &mut dyn NodePass)]) -> Result<(), PassError> {
        if passes.is_empty() {
            warn!("no passes registered, nothing to run");
            return Err(PassError::EmptyPipeline);
        }
        debug!(
            "running {} passes on graph \"{}\"",
            passes.len(),
            self.graph.name()
        );
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut deleted: HashSet<NodeId> = HashSet::new();
        let mut repass: HashSet<NodeId> = HashSet::new();
        let mut deferred: HashSet<NodeId> = HashSet::new();
        for id in self.graph.nodes() {
            let fan_in = self.graph.in_nodes(id).len();
            if fan_in == 0 {
                queue.push_back(id);
                seen.insert(id);
            } else if fan_in > DEFERRED_FAN_IN {
                deferred.insert(id);
            }
        }
        debug!("{} start nodes without input edges", queue.len());

        let mut rounds = 0usize;
        loop {
            for &node in &repass {
                queue.push_back(node);
                seen.insert(node);
            }
            repass.clear();
            while let Some(node) = queue.pop_front() {
                repass.remove(&node);
                if deleted.contains(&node) {
                    debug!("node {} was deleted, visit skipped", node.index());
                    continue;
                }
                if !self.graph.contains(node) {
                    continue;
                }
                // enqueue ready successors before the passes can rewire them
                for succ in self.graph.out_nodes(node) {
                    if deferred.contains(&succ) {
                        continue;
                    }
                    if all_preds_seen(self.graph, succ, &seen) && seen.insert(succ) {
                        queue.push_back(succ);
                    }
                }
                run_passes(self.graph, node, passes, &mut repass, &mut deleted, &seen)?;
            }
            // wide nodes join once their whole fan-in was seen; the rest are
            // dropped with the round
            let ready: Vec<NodeId> = deferred
                .iter()
                .copied()
                .filter(|n| all_preds_seen(self.graph, *n, &seen))
                .collect();
            for node in ready {
                if seen.insert(node) {
                    queue.push_back(node);
                }
            }
            deferred.clear();

            rounds += 1;
            if queue.is_empty() && repass.is_empty() {
                break;
            }
            if rounds >= MAX_SCHEDULE_ROUNDS {
                warn!(
                    "pass scheduling stopped after {MAX_SCHEDULE_ROUNDS} rounds without reaching a fixed point"
                );
                break;
            }
        }
        debug!("all passes done after {rounds} rounds");
        Ok(())
    }
}
