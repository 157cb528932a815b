//! C7: service orchestration (`spec.md` §4.7) — the glue that bootstraps
//! every other component in order and tears them down in reverse.

pub mod orchestrator;

pub use orchestrator::Service;
