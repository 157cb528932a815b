//! C4: the sync pipeline that turns batches of events into graph
//! mutations (`spec.md` §4.4).

pub mod graph;
pub mod mutation;
pub mod pipeline;

pub use graph::{GraphClient, InMemoryGraphClient, Neo4jGraphClient};
pub use mutation::{derive_mutations, GraphMutation, MutationKind};
pub use pipeline::{BatchOutcome, PipelineConfig, PipelineState, PipelineStats, SyncPipeline};
