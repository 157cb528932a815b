//! Resource status derivation, shared by the sync pipeline (C4, which
//! stamps a `StatusVersion`'s `status` on each `ResourceModified`) and the
//! timeline planner (C5, which derives each `StatusSegment`'s `status`)
//! so the two components never disagree about what a manifest means.
//! `spec.md` §4.5 step 4.
//!
//! Grounded on no one teacher file — the teacher's AS-OF model had no
//! status concept at all — but kept in the same small-enum-plus-free-
//! function shape as `core::temporal`/`core::event` for consistency with
//! the rest of `core`.

use serde_json::Value;

/// One of the five states the planner and pipeline classify a resource
/// into. `Unknown` is the fallback for any manifest shape this crate
/// doesn't recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Status {
    Ready,
    Warning,
    Error,
    Terminating,
    Unknown,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Ready => "Ready",
            Status::Warning => "Warning",
            Status::Error => "Error",
            Status::Terminating => "Terminating",
            Status::Unknown => "Unknown",
        }
    }
}

/// Reasons that mean "this isn't ready yet, but it's expected to recover
/// on its own" rather than a genuine error. Mirrors kubectl's own status
/// summary defaults; overridable per-deployment via `config::Config`
/// (see `SPEC_FULL.md` §9's note that only this keyword list, not the
/// whole status table, is configurable).
pub fn default_transient_causes() -> Vec<String> {
    [
        "ContainersNotReady",
        "PodInitializing",
        "ImagePullBackOff",
        "ProgressDeadlineExceeded",
        "ReplicaSetUpdating",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Derive `(status, message)` from a captured manifest. `deleted` is the
/// planner's/pipeline's own signal (whether this event is a
/// `ResourceDeleted`, or whether `deleted_at` falls within this
/// `StatusSegment`) — it is never read out of the manifest itself.
pub fn derive_status(manifest: &Value, deleted: bool, transient_causes: &[String]) -> (Status, String) {
    if deleted {
        return (Status::Terminating, "resource is terminating".to_string());
    }

    let Some(ready_condition) = find_ready_condition(manifest) else {
        return (Status::Unknown, "no Ready condition in manifest status".to_string());
    };

    let condition_status = ready_condition.get("status").and_then(Value::as_str).unwrap_or("");
    let reason = ready_condition.get("reason").and_then(Value::as_str).unwrap_or("");
    let message = ready_condition
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(reason)
        .to_string();

    match condition_status {
        "True" => (Status::Ready, message),
        "False" => {
            if transient_causes.iter().any(|cause| reason.contains(cause.as_str())) {
                (Status::Warning, message)
            } else {
                (Status::Error, message)
            }
        }
        _ => (Status::Unknown, message),
    }
}

fn find_ready_condition(manifest: &Value) -> Option<&Value> {
    manifest
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
}

/// Deterministic content hash of a manifest, used to coalesce duplicate
/// `StatusVersion`s for the same `(uid, manifest_hash)` (`spec.md` §4.4).
pub fn manifest_hash(manifest: &Value) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    // `Value`'s `Hash` impl isn't derived, so hash its canonical string
    // form; `serde_json` serializes object keys in insertion order, but
    // events always build manifests from the same deserialize path, so
    // the order is stable for a given source document.
    let canonical = serde_json::to_string(manifest).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
