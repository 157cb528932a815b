//! C5: reconstructs per-resource status timelines from the segment log on
//! demand and serves them over gRPC (`spec.md` §4.5, §6.3).

pub mod cursor;
pub mod grpc;
pub mod reconstruct;
pub mod status;

pub use cursor::Cursor;
pub use grpc::{proto, TimelinePlanner};
pub use reconstruct::{reconstruct, Metadata, PlannerResult, ResourceBatch, ResourceHistory, StatusSegment, TimelineQuery};
pub use status::StatusRules;
