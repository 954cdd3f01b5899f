pub mod dtype;
pub mod graph;
pub mod partition;
pub mod pass;
pub mod placement;

pub use dtype::{DType, Format};
pub use graph::op::{OpDesc, TensorDesc};
pub use graph::{ComputeGraph, Endpoint, GraphError, NodeId};
pub use partition::{
    BoundaryPair, BoundaryRef, BoundaryTable, GraphPartitioner, PartitionContext, PartitionError,
    PartitionMode, SubgraphInfo,
};
pub use pass::{NodePass, PassError, PassRecorder, PassScheduler};
pub use placement::{EnginePlacer, NameMapPlacer, PlacementError};
