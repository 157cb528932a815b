//! Status derivation as the timeline planner consumes it (`spec.md` §4.5
//! step 4).
//!
//! The derivation rules themselves live in `core::status` and are shared
//! verbatim with the sync pipeline (C4), so the two components never
//! disagree about what a manifest means. What's configurable per
//! deployment is narrower than the full per-kind rule table a literal
//! reading of "pluggable status-derivation table" might suggest: the
//! status mapping (`True`/`False`/missing -> Ready/Warning/Error/Unknown)
//! is the same for every object kind and is not extracted to config —
//! only the transient-cause keyword list that tells a `False` condition
//! apart as `Warning` rather than `Error` is deployment-tunable.
//! (Recorded as a resolved open question in `DESIGN.md`.)

use crate::core::status::{default_transient_causes, derive_status, Status};
use serde_json::Value;

/// The planner's view of the status configuration: just the transient
/// causes, not a per-kind rule table.
#[derive(Debug, Clone)]
pub struct StatusRules {
    transient_causes: Vec<String>,
}

impl Default for StatusRules {
    fn default() -> Self {
        Self { transient_causes: default_transient_causes() }
    }
}

impl StatusRules {
    pub fn new(transient_causes: Vec<String>) -> Self {
        Self { transient_causes }
    }

    /// Derive `(status, message)` for a manifest observed at a point in a
    /// resource's lifetime. `deleted` is true only for the segment that
    /// starts at a `ResourceDeleted` event, never inferred from the
    /// manifest itself.
    pub fn derive(&self, manifest: &Value, deleted: bool) -> (Status, String) {
        derive_status(manifest, deleted, &self.transient_causes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_rules_classify_a_ready_manifest() {
        let rules = StatusRules::default();
        let manifest = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        let (status, _) = rules.derive(&manifest, false);
        assert_eq!(status, Status::Ready);
    }

    #[test]
    fn custom_transient_causes_override_the_default_list() {
        let rules = StatusRules::new(vec!["MyCustomReason".to_string()]);
        let manifest = json!({"status": {"conditions": [
            {"type": "Ready", "status": "False", "reason": "MyCustomReason"}
        ]}});
        let (status, _) = rules.derive(&manifest, false);
        assert_eq!(status, Status::Warning);
    }

    #[test]
    fn deleted_segment_is_always_terminating() {
        let rules = StatusRules::default();
        let (status, _) = rules.derive(&json!({}), true);
        assert_eq!(status, Status::Terminating);
    }
}
