//! The external graph database collaborator (`spec.md` §1: "specified only
//! by interface"). `GraphClient` is the seam; `Neo4jGraphClient` is the real
//! backing (a Cypher-speaking property graph, per §1's "Cypher-like query
//! surface"), `InMemoryGraphClient` is the in-process test double every
//! pipeline test runs against.
//!
//! Grounded on the teacher's `storage::journal::EventJournal` trait +
//! `InMemoryJournal` pairing: an `#[async_trait]` seam with exactly one
//! real implementation and one in-memory double used throughout the test
//! suite, never a mock framework, for the one true external boundary in
//! this crate.

use crate::core::status::Status;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::pipeline::mutation::MutationKind;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// The schema and query surface C4 imposes on the external graph, and the
/// lifecycle operations C6/C7 need (`ping`, `init_schema`,
/// `any_node_exists`).
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Round-trip to confirm the graph is reachable (`spec.md` §4.7 step 2).
    async fn ping(&self) -> Result<()>;

    /// Create the uniqueness constraints/indexes this crate's schema
    /// relies on (`uid` on `Resource`, `event_uid` on `Event`,
    /// `(uid, manifest_hash)` on `StatusVersion`) — `spec.md` §4.7 step 3.
    async fn init_schema(&self) -> Result<()>;

    /// Whether the graph has any node at all — the "empty" check
    /// `RebuildIfEmptyOnly` gates on (`spec.md` §9, resolved in
    /// `DESIGN.md`: any node, not just schema metadata, counts).
    async fn any_node_exists(&self) -> Result<bool>;

    /// Apply every mutation in one atomic unit. All succeed or all fail —
    /// `spec.md` §4.4's "Application is per-batch transactional".
    async fn apply(&self, mutations: &[MutationKind]) -> Result<()>;
}

/// Builds and runs the Cypher this crate's schema requires over a real
/// Neo4j-compatible graph (`neo4rs`, a bolt-protocol client).
pub struct Neo4jGraphClient {
    graph: neo4rs::Graph,
}

impl Neo4jGraphClient {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = neo4rs::Graph::new(uri, user, password)
            .await
            .map_err(|e| Error::Transient(format!("graph connect failed: {e}")))?;
        Ok(Self { graph })
    }

    fn cypher_for(mutation: &MutationKind) -> neo4rs::Query {
        match mutation {
            MutationKind::UpsertResourceNode { uid, api_version, kind, namespace, name, created_at } => {
                neo4rs::query(
                    "MERGE (r:Resource {uid: $uid}) \
                     ON CREATE SET r.api_version = $api_version, r.kind = $kind, \
                       r.namespace = $namespace, r.name = $name, r.created_at = $created_at",
                )
                .param("uid", uid.as_str())
                .param("api_version", api_version.as_str())
                .param("kind", kind.as_str())
                .param("namespace", namespace.as_str())
                .param("name", name.as_str())
                .param("created_at", created_at.as_nanos())
            }
            MutationKind::AppendStatusVersion { uid, status, message, timestamp, manifest_hash } => {
                neo4rs::query(
                    "MERGE (r:Resource {uid: $uid}) \
                     MERGE (r)-[:HAS_VERSION]->(v:StatusVersion {uid: $uid, manifest_hash: $manifest_hash}) \
                     ON CREATE SET v.status = $status, v.message = $message, v.timestamp = $timestamp",
                )
                .param("uid", uid.as_str())
                .param("manifest_hash", manifest_hash.as_str())
                .param("status", status.name())
                .param("message", message.as_str())
                .param("timestamp", timestamp.as_nanos())
            }
            MutationKind::MarkDeleted { uid, deleted_at } => {
                neo4rs::query("MERGE (r:Resource {uid: $uid}) SET r.deleted_at = $deleted_at")
                    .param("uid", uid.as_str())
                    .param("deleted_at", deleted_at.as_nanos())
            }
            MutationKind::UpsertEventNode { event_uid, timestamp, reason, message } => {
                neo4rs::query(
                    "MERGE (e:Event {uid: $uid}) \
                     ON CREATE SET e.timestamp = $timestamp, e.reason = $reason, e.message = $message",
                )
                .param("uid", event_uid.as_str())
                .param("timestamp", timestamp.as_nanos())
                .param("reason", reason.as_str())
                .param("message", message.as_str())
            }
            MutationKind::LinkAffects { event_uid, involved_uid } => neo4rs::query(
                "MATCH (e:Event {uid: $event_uid}) \
                 MERGE (r:Resource {uid: $involved_uid}) \
                 MERGE (e)-[:AFFECTS]->(r)",
            )
            .param("event_uid", event_uid.as_str())
            .param("involved_uid", involved_uid.as_str()),
        }
    }
}

#[async_trait]
impl GraphClient for Neo4jGraphClient {
    async fn ping(&self) -> Result<()> {
        self.graph
            .run(neo4rs::query("RETURN 1"))
            .await
            .map_err(|e| Error::Transient(format!("graph ping failed: {e}")))
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT resource_uid IF NOT EXISTS FOR (r:Resource) REQUIRE r.uid IS UNIQUE",
            "CREATE CONSTRAINT event_uid IF NOT EXISTS FOR (e:Event) REQUIRE e.uid IS UNIQUE",
            "CREATE CONSTRAINT status_version_key IF NOT EXISTS FOR (v:StatusVersion) REQUIRE (v.uid, v.manifest_hash) IS UNIQUE",
        ];
        for stmt in statements {
            self.graph
                .run(neo4rs::query(stmt))
                .await
                .map_err(|e| Error::Fatal(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn any_node_exists(&self) -> Result<bool> {
        let mut stream = self
            .graph
            .execute(neo4rs::query("MATCH (n) RETURN n LIMIT 1"))
            .await
            .map_err(|e| Error::Transient(format!("any_node_exists query failed: {e}")))?;
        Ok(stream
            .next()
            .await
            .map_err(|e| Error::Transient(format!("any_node_exists fetch failed: {e}")))?
            .is_some())
    }

    async fn apply(&self, mutations: &[MutationKind]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut txn = self
            .graph
            .start_txn()
            .await
            .map_err(|e| classify_graph_error(&e, "starting transaction"))?;

        for mutation in mutations {
            if let Err(e) = txn.run(Self::cypher_for(mutation)).await {
                let classified = classify_graph_error(&e, "applying mutation");
                let _ = txn.rollback().await;
                return Err(classified);
            }
        }

        txn.commit().await.map_err(|e| classify_graph_error(&e, "committing transaction"))
    }
}

/// Neo4j errors don't carry a machine-readable transient/non-transient
/// tag, so this maps by message shape: connection/timeout language is
/// `Transient` (retryable per `spec.md` §4.4); anything else (a
/// constraint/schema violation, a malformed query) is `Query`, which the
/// pipeline treats as non-transient and drops the batch for.
fn classify_graph_error(e: &neo4rs::Error, context: &str) -> Error {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("refused")
        || lower.contains("broken pipe")
        || lower.contains("unavailable")
    {
        Error::Transient(format!("{context}: {msg}"))
    } else {
        Error::Query(format!("{context}: {msg}"))
    }
}

/// In-memory graph used by every pipeline/rebuild/planner-adjacent test and
/// by `cargo run`-free smoke scenarios — never the production path.
#[derive(Debug, Default)]
pub struct InMemoryGraphClient {
    state: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    resources: BTreeMap<String, ResourceNode>,
    status_versions: BTreeSet<(String, String)>,
    events: BTreeMap<String, EventNode>,
    affects: BTreeSet<(String, String)>,
    schema_initialized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub uid: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub created_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
    pub status_versions: Vec<(Status, String, Timestamp)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventNode {
    pub uid: String,
    pub timestamp: Timestamp,
    pub reason: String,
    pub message: String,
}

impl InMemoryGraphClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(&self, uid: &str) -> Option<ResourceNode> {
        self.state.lock().unwrap().resources.get(uid).cloned()
    }

    pub fn event(&self, uid: &str) -> Option<EventNode> {
        self.state.lock().unwrap().events.get(uid).cloned()
    }

    pub fn affects(&self, event_uid: &str, resource_uid: &str) -> bool {
        self.state.lock().unwrap().affects.contains(&(event_uid.to_string(), resource_uid.to_string()))
    }

    pub fn resource_count(&self) -> usize {
        self.state.lock().unwrap().resources.len()
    }
}

#[async_trait]
impl GraphClient for InMemoryGraphClient {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        self.state.lock().unwrap().schema_initialized = true;
        Ok(())
    }

    async fn any_node_exists(&self) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(!state.resources.is_empty() || !state.events.is_empty())
    }

    async fn apply(&self, mutations: &[MutationKind]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for mutation in mutations {
            match mutation {
                MutationKind::UpsertResourceNode { uid, api_version, kind, namespace, name, created_at } => {
                    state.resources.entry(uid.clone()).or_insert_with(|| ResourceNode {
                        uid: uid.clone(),
                        api_version: api_version.clone(),
                        kind: kind.clone(),
                        namespace: namespace.clone(),
                        name: name.clone(),
                        created_at: *created_at,
                        deleted_at: None,
                        status_versions: Vec::new(),
                    });
                }
                MutationKind::AppendStatusVersion { uid, status, message, timestamp, manifest_hash } => {
                    let key = (uid.clone(), manifest_hash.clone());
                    if state.status_versions.insert(key) {
                        if let Some(node) = state.resources.get_mut(uid) {
                            node.status_versions.push((*status, message.clone(), *timestamp));
                        }
                    }
                }
                MutationKind::MarkDeleted { uid, deleted_at } => {
                    state.resources.entry(uid.clone()).or_insert_with(|| ResourceNode {
                        uid: uid.clone(),
                        api_version: String::new(),
                        kind: String::new(),
                        namespace: String::new(),
                        name: String::new(),
                        created_at: *deleted_at,
                        deleted_at: None,
                        status_versions: Vec::new(),
                    });
                    state.resources.get_mut(uid).unwrap().deleted_at = Some(*deleted_at);
                }
                MutationKind::UpsertEventNode { event_uid, timestamp, reason, message } => {
                    state.events.entry(event_uid.clone()).or_insert_with(|| EventNode {
                        uid: event_uid.clone(),
                        timestamp: *timestamp,
                        reason: reason.clone(),
                        message: message.clone(),
                    });
                }
                MutationKind::LinkAffects { event_uid, involved_uid } => {
                    state.affects.insert((event_uid.clone(), involved_uid.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::mutation::derive_mutations;
    use crate::core::event::{Event, EventKind};
    use serde_json::json;

    fn event(kind: EventKind, uid: &str, manifest: serde_json::Value) -> Event {
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

    #[tokio::test]
    async fn apply_upserts_a_resource_node() {
        let client = InMemoryGraphClient::new();
        let e = event(EventKind::ResourceAdded, "uid-1", json!({}));
        client.apply(&derive_mutations(&e, &[])).await.unwrap();
        assert!(client.resource("uid-1").is_some());
        assert_eq!(client.resource_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_status_versions_are_coalesced() {
        let client = InMemoryGraphClient::new();
        let manifest = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        let e = event(EventKind::ResourceModified, "uid-1", manifest);
        client.apply(&derive_mutations(&e, &[])).await.unwrap();
        client.apply(&derive_mutations(&e, &[])).await.unwrap();
        assert_eq!(client.resource("uid-1").unwrap().status_versions.len(), 1);
    }

    #[tokio::test]
    async fn deletion_never_removes_the_node() {
        let client = InMemoryGraphClient::new();
        client.apply(&derive_mutations(&event(EventKind::ResourceAdded, "uid-1", json!({})), &[])).await.unwrap();
        client.apply(&derive_mutations(&event(EventKind::ResourceDeleted, "uid-1", json!({})), &[])).await.unwrap();
        let node = client.resource("uid-1").unwrap();
        assert!(node.deleted_at.is_some());
    }

    #[tokio::test]
    async fn any_node_exists_reflects_graph_state() {
        let client = InMemoryGraphClient::new();
        assert!(!client.any_node_exists().await.unwrap());
        client.apply(&derive_mutations(&event(EventKind::ResourceAdded, "uid-1", json!({})), &[])).await.unwrap();
        assert!(client.any_node_exists().await.unwrap());
    }
}
