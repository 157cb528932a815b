//! Deterministic derivation of `GraphMutation`s from an `Event`
//! (`spec.md` §3 `GraphMutation`, §4.4 derivation rules).
//!
//! Two replays of the same event must produce identical mutations — this
//! module has no side effects and reads nothing but the event and the
//! caller-supplied transient-cause list (itself a pure input, not runtime
//! state), so that property holds by construction.

use crate::core::event::{Event, EventKind};
use crate::core::status::{derive_status, manifest_hash, Status};
use crate::core::temporal::Timestamp;
use serde_json::Value;

/// One upsert/delete derived from an event, tagged with the source event's
/// timestamp per `spec.md` §3.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphMutation {
    pub source_timestamp: Timestamp,
    pub kind: MutationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    /// `ResourceAdded`/`K8sEvent`'s involved-object upsert: ensures the node
    /// exists, keyed by `uid`, with identity labels. `created_at` is only
    /// set the first time a node is created — a later upsert for a node
    /// that already exists (e.g. the involved-object stub `K8sEvent`
    /// creates ahead of time) must not clobber it, so this carries
    /// `created_at` as "set on create, never on match" (`spec.md` §4.4's
    /// "a later ResourceAdded fills in properties").
    UpsertResourceNode {
        uid: String,
        api_version: String,
        kind: String,
        namespace: String,
        name: String,
        created_at: Timestamp,
    },
    /// `ResourceModified`: append a `StatusVersion` sub-node linked
    /// `HAS_VERSION`. The graph layer coalesces duplicates by making
    /// `(uid, manifest_hash)` the natural key of the `MERGE` this compiles
    /// to — `derive_mutations` itself doesn't need replay state to see this
    /// property hold.
    AppendStatusVersion {
        uid: String,
        status: Status,
        message: String,
        timestamp: Timestamp,
        manifest_hash: String,
    },
    /// `ResourceDeleted`: stamp `deleted_at`, never remove the node.
    MarkDeleted { uid: String, deleted_at: Timestamp },
    /// `K8sEvent`: upsert an `Event` node keyed by the event's own `uid`
    /// (a Kubernetes `Event` object has its own identity, distinct from the
    /// object it's about).
    UpsertEventNode {
        event_uid: String,
        timestamp: Timestamp,
        reason: String,
        message: String,
    },
    /// `K8sEvent`: link the `Event` node to the involved object's node,
    /// identified by `parent_uid` (`spec.md` §3's "optional parent-object
    /// `uid` (for K8sEvent records)").
    LinkAffects {
        event_uid: String,
        involved_uid: String,
    },
}

/// Derive this event's mutations. `transient_causes` feeds
/// `derive_status` for `ResourceModified`'s status stamp; it is config, not
/// runtime state, so determinism is preserved for a fixed config.
pub fn derive_mutations(event: &Event, transient_causes: &[String]) -> Vec<MutationKind> {
    match event.kind {
        EventKind::ResourceAdded => vec![MutationKind::UpsertResourceNode {
            uid: event.uid.clone(),
            api_version: event.api_version.clone(),
            kind: event.object_kind.clone(),
            namespace: event.namespace.clone(),
            name: event.name.clone(),
            created_at: event.timestamp,
        }],
        EventKind::ResourceModified => {
            let (status, message) = derive_status(&event.manifest, false, transient_causes);
            vec![
                MutationKind::UpsertResourceNode {
                    uid: event.uid.clone(),
                    api_version: event.api_version.clone(),
                    kind: event.object_kind.clone(),
                    namespace: event.namespace.clone(),
                    name: event.name.clone(),
                    created_at: event.timestamp,
                },
                MutationKind::AppendStatusVersion {
                    uid: event.uid.clone(),
                    status,
                    message,
                    timestamp: event.timestamp,
                    manifest_hash: manifest_hash(&event.manifest),
                },
            ]
        }
        EventKind::ResourceDeleted => vec![MutationKind::MarkDeleted {
            uid: event.uid.clone(),
            deleted_at: event.timestamp,
        }],
        EventKind::K8sEvent => {
            let mut mutations = vec![MutationKind::UpsertEventNode {
                event_uid: event.uid.clone(),
                timestamp: event.timestamp,
                reason: event.manifest.pointer("/reason").and_then(Value::as_str).unwrap_or("").to_string(),
                message: event.manifest.pointer("/message").and_then(Value::as_str).unwrap_or("").to_string(),
            }];
            if let Some(parent_uid) = &event.parent_uid {
                mutations.push(MutationKind::UpsertResourceNode {
                    uid: parent_uid.clone(),
                    api_version: event
                        .manifest
                        .pointer("/involvedObject/apiVersion")
                        .and_then(Value::as_str)
                        .unwrap_or(&event.api_version)
                        .to_string(),
                    kind: event
                        .manifest
                        .pointer("/involvedObject/kind")
                        .and_then(Value::as_str)
                        .unwrap_or(&event.object_kind)
                        .to_string(),
                    namespace: event
                        .manifest
                        .pointer("/involvedObject/namespace")
                        .and_then(Value::as_str)
                        .unwrap_or(&event.namespace)
                        .to_string(),
                    name: event
                        .manifest
                        .pointer("/involvedObject/name")
                        .and_then(Value::as_str)
                        .unwrap_or(&event.name)
                        .to_string(),
                    created_at: event.timestamp,
                });
                mutations.push(MutationKind::LinkAffects {
                    event_uid: event.uid.clone(),
                    involved_uid: parent_uid.clone(),
                });
            }
            mutations
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::temporal::Timestamp;
    use serde_json::json;

    fn event(kind: EventKind, uid: &str, manifest: Value) -> Event {
        Event::new(
            format!("evt-{uid}"),
            Timestamp::from_secs(100),
            "cluster-a".to_string(),
            "inst-1".to_string(),
            kind,
            "v1".to_string(),
            "Pod".to_string(),
            "default".to_string(),
            "my-pod".to_string(),
            uid.to_string(),
            manifest,
        )
    }

    #[test]
    fn resource_added_upserts_one_node() {
        let e = event(EventKind::ResourceAdded, "uid-1", json!({}));
        let mutations = derive_mutations(&e, &[]);
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], MutationKind::UpsertResourceNode { .. }));
    }

    #[test]
    fn resource_modified_upserts_and_appends_status_version() {
        let manifest = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        let e = event(EventKind::ResourceModified, "uid-1", manifest);
        let mutations = derive_mutations(&e, &[]);
        assert_eq!(mutations.len(), 2);
        assert!(matches!(mutations[1], MutationKind::AppendStatusVersion { status: Status::Ready, .. }));
    }

    #[test]
    fn resource_deleted_marks_deleted_without_removing() {
        let e = event(EventKind::ResourceDeleted, "uid-1", json!({}));
        let mutations = derive_mutations(&e, &[]);
        assert_eq!(mutations, vec![MutationKind::MarkDeleted { uid: "uid-1".to_string(), deleted_at: Timestamp::from_secs(100) }]);
    }

    #[test]
    fn k8s_event_without_parent_uid_only_upserts_event_node() {
        let e = event(EventKind::K8sEvent, "evt-uid-1", json!({"reason": "Scheduled"}));
        let mutations = derive_mutations(&e, &[]);
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], MutationKind::UpsertEventNode { .. }));
    }

    #[test]
    fn k8s_event_with_parent_uid_links_affects() {
        let manifest = json!({
            "reason": "Scheduled",
            "involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "default", "name": "my-pod"}
        });
        let e = event(EventKind::K8sEvent, "evt-uid-1", manifest).with_parent_uid("pod-uid-1".to_string());
        let mutations = derive_mutations(&e, &[]);
        assert_eq!(mutations.len(), 3);
        assert!(matches!(&mutations[2], MutationKind::LinkAffects { involved_uid, .. } if involved_uid == "pod-uid-1"));
    }

    #[test]
    fn derivation_is_deterministic_across_replays() {
        let e = event(EventKind::ResourceModified, "uid-1", json!({"status": {"conditions": []}}));
        assert_eq!(derive_mutations(&e, &[]), derive_mutations(&e, &[]));
    }
}
