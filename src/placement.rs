//! Engine assignment for compute graph nodes.

use crate::graph::{ComputeGraph, NodeId};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no engine assignment for node \"{0}\"")]
    Unplaced(String),
}

/// Decides which engine runs each node. Implementations may leave nodes out
/// of the returned map; the caller decides whether that is fatal.
pub trait EnginePlacer {
    fn place(&self, graph: &ComputeGraph) -> Result<HashMap<NodeId, String>, PlacementError>;
}

/// Runs the placer and stamps each assignment onto the node attributes.
pub fn apply_placement(
    graph: &mut ComputeGraph,
    placer: &dyn EnginePlacer,
) -> Result<HashMap<NodeId, String>, PlacementError> {
    let assignments = placer.place(graph)?;
    for (id, engine) in &assignments {
        if let Some(node) = graph.node_mut(*id) {
            node.op_mut().attrs.engine = Some(engine.clone());
        }
    }
    Ok(assignments)
}

/// Table-driven placer: looks up engines by node name, with an optional
/// fallback engine for unlisted nodes.
#[derive(Clone, Debug, Default)]
pub struct NameMapPlacer {
    assignments: HashMap<String, String>,
    default_engine: Option<String>,
}

impl NameMapPlacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(engine: impl Into<String>) -> Self {
        Self {
            assignments: HashMap::new(),
            default_engine: Some(engine.into()),
        }
    }

    pub fn assign(mut self, node: impl Into<String>, engine: impl Into<String>) -> Self {
        self.assignments.insert(node.into(), engine.into());
        self
    }
}

impl EnginePlacer for NameMapPlacer {
    fn place(&self, graph: &ComputeGraph) -> Result<HashMap<NodeId, String>, PlacementError> {
        let mut out = HashMap::new();
        for id in graph.nodes() {
            if let Some(node) = graph.node(id) {
                if let Some(engine) = self
                    .assignments
                    .get(node.name())
                    .or(self.default_engine.as_ref())
                {
                    out.insert(id, engine.clone());
                }
            }
        }
        Ok(out)
    }
}
