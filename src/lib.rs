//! Spectre: a Kubernetes cluster state-history engine.
//!
//! Ingests cluster change events, appends them to a time-partitioned
//! segment log, derives a property-graph view via a sync pipeline, and
//! answers timeline queries by reconstructing resource history straight
//! from the segment log rather than the graph.
//!
//! # Core concepts
//!
//! - **Events**: immutable records of one cluster change (`core::event`).
//! - **Segments**: append-only, time-bucketed files the event log is split
//!   into (`storage::segment`).
//! - **Timelines**: per-resource status history reconstructed on demand
//!   from segments (`core::timeline`, `planner`).

pub mod cli;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod export;
pub mod listener;
pub mod pipeline;
pub mod planner;
pub mod rebuild;
pub mod service;
pub mod storage;

/// Common imports for consumers of this crate.
pub mod prelude {
    pub use crate::core::event::{Event, EventKind, ResourceIdentity};
    pub use crate::core::temporal::{TimeRange, Timestamp};
    pub use crate::error::{Error, Result};
    pub use crate::planner::TimelineQuery;
}
