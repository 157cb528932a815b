//! C6: replays a time window of persisted events through the sync pipeline
//! to repopulate an empty (or assumed-empty) graph on startup (`spec.md`
//! §4.6).
//!
//! Grounded on no teacher analogue — the teacher's AS-OF model never needed
//! to repopulate a second store from its own journal — built directly out
//! of already-grounded pieces: `storage::store::SegmentStore::scan` (C2's
//! read path) feeding synthetic `listener::Batch`es into
//! `pipeline::SyncPipeline::process_batch` (C4's retry/drop semantics,
//! reused rather than duplicated).

use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::listener::Batch;
use crate::pipeline::graph::GraphClient;
use crate::pipeline::{BatchOutcome, SyncPipeline};
use crate::storage::store::{EventFilter, SegmentStore};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tunables surfaced through `config::Config`'s `[rebuild]` section.
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    /// `RebuildOnStart`: whether C7 runs the rebuilder at all.
    pub rebuild_on_start: bool,
    /// `RebuildIfEmptyOnly`: skip the rebuild if the graph already has any
    /// node (`spec.md` §9's third open question, pinned in `DESIGN.md`:
    /// "any node present" rather than attempting to distinguish schema-only
    /// emptiness).
    pub rebuild_if_empty_only: bool,
    /// How far back from now to replay.
    pub window: Duration,
    /// Size of each synthetic batch handed to `SyncPipeline::process_batch`.
    pub batch_size: usize,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            rebuild_on_start: true,
            rebuild_if_empty_only: true,
            window: Duration::from_secs(24 * 3600),
            batch_size: 500,
        }
    }
}

/// Outcome of one `Rebuilder::run` call, reported to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub ran: bool,
    pub skipped_reason: Option<String>,
    pub batches_applied: u64,
    pub batches_dropped: u64,
    pub streams_scanned: u64,
    pub events_per_kind: BTreeMap<String, u64>,
}

/// Replays `[now - window, now]` from every `(cluster_id, instance_id)`
/// stream the store holds, through `SyncPipeline::process_batch`.
pub struct Rebuilder {
    config: RebuildConfig,
}

impl Rebuilder {
    pub fn new(config: RebuildConfig) -> Self {
        Self { config }
    }

    /// Run the rebuild, per `spec.md` §4.6's three steps. `graph` is asked
    /// directly about emptiness rather than through the pipeline, since the
    /// pipeline has no read path of its own.
    pub async fn run(
        &self,
        store: &SegmentStore,
        pipeline: &SyncPipeline,
        graph: &dyn GraphClient,
        cancel: &CancellationToken,
    ) -> Result<RebuildReport> {
        if !self.config.rebuild_on_start {
            return Ok(RebuildReport {
                skipped_reason: Some("RebuildOnStart is false".to_string()),
                ..Default::default()
            });
        }

        if self.config.rebuild_if_empty_only && graph.any_node_exists().await? {
            return Ok(RebuildReport {
                skipped_reason: Some("graph already has at least one node".to_string()),
                ..Default::default()
            });
        }

        let end = Timestamp::now();
        let start = Timestamp::from_nanos(end.as_nanos().saturating_sub(self.config.window.as_nanos() as i64));

        let mut report = RebuildReport { ran: true, ..Default::default() };
        let pairs = store.cluster_instance_pairs();
        info!(pairs = pairs.len(), window_secs = self.config.window.as_secs(), "rebuild starting");

        for (cluster_id, instance_id) in pairs {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            report.streams_scanned += 1;
            self.replay_stream(store, pipeline, &cluster_id, &instance_id, start, end, cancel, &mut report).await?;
        }

        info!(
            batches_applied = report.batches_applied,
            batches_dropped = report.batches_dropped,
            "rebuild complete"
        );
        Ok(report)
    }

    async fn replay_stream(
        &self,
        store: &SegmentStore,
        pipeline: &SyncPipeline,
        cluster_id: &str,
        instance_id: &str,
        start: Timestamp,
        end: Timestamp,
        cancel: &CancellationToken,
        report: &mut RebuildReport,
    ) -> Result<()> {
        let mut iter = store.scan(cluster_id, instance_id, start, end, EventFilter::default())?;
        let mut accumulation = Vec::with_capacity(self.config.batch_size);
        let mut seq = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match iter.next() {
                Some(Ok(event)) => {
                    *report.events_per_kind.entry(event.kind.name().to_string()).or_insert(0) += 1;
                    accumulation.push(event);
                    if accumulation.len() >= self.config.batch_size {
                        self.flush(pipeline, cluster_id, &mut accumulation, &mut seq, report).await;
                    }
                }
                Some(Err(Error::CorruptRecord(msg))) => {
                    // A poisoned segment doesn't abort the whole rebuild
                    // (`spec.md` §4.6 point 3); the remaining streams still
                    // replay. The segment itself is already quarantined by
                    // the store's own scan path.
                    warn!(cluster_id, instance_id, error = %msg, "corrupt segment during rebuild replay, skipping rest of this stream");
                    break;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        if !accumulation.is_empty() {
            self.flush(pipeline, cluster_id, &mut accumulation, &mut seq, report).await;
        }
        Ok(())
    }

    async fn flush(
        &self,
        pipeline: &SyncPipeline,
        cluster_id: &str,
        accumulation: &mut Vec<crate::core::event::Event>,
        seq: &mut u64,
        report: &mut RebuildReport,
    ) {
        let events = std::mem::take(accumulation);
        let batch = Batch { batch_id: format!("rebuild-{cluster_id}-{seq}"), events, created_at: Timestamp::now() };
        *seq += 1;
        match pipeline.process_batch(&batch).await {
            BatchOutcome::Applied => report.batches_applied += 1,
            BatchOutcome::Dropped => report.batches_dropped += 1,
            BatchOutcome::Empty => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{Event, EventKind};
    use crate::pipeline::graph::InMemoryGraphClient;
    use crate::pipeline::PipelineConfig;
    use crate::storage::store::StoreConfig;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_event(secs: i64, uid: &str) -> Event {
        event_with_kind(secs, uid, EventKind::ResourceAdded)
    }

    fn event_with_kind(secs: i64, uid: &str, kind: EventKind) -> Event {
        Event::new(
            format!("evt-{uid}-{secs}"),
            Timestamp::from_secs(secs),
            "cluster-a".to_string(),
            "inst-1".to_string(),
            kind,
            "v1".to_string(),
            "Pod".to_string(),
            "default".to_string(),
            "my-pod".to_string(),
            uid.to_string(),
            json!({}),
        )
    }

    fn test_store(root: &std::path::Path) -> SegmentStore {
        let mut config = StoreConfig::new(root);
        config.fsync_interval = Duration::from_millis(0);
        SegmentStore::open(config).unwrap().0
    }

    fn test_store_with_bucket(root: &std::path::Path, bucket_secs: u64) -> SegmentStore {
        let mut config = StoreConfig::new(root);
        config.fsync_interval = Duration::from_millis(0);
        config.bucket_duration_nanos = Duration::from_secs(bucket_secs).as_nanos() as i64;
        SegmentStore::open(config).unwrap().0
    }

    #[tokio::test]
    async fn rebuild_replays_persisted_events_into_the_graph() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let now_secs = Timestamp::now().as_secs();
        store.append(&sample_event(now_secs, "uid-1")).unwrap();
        store.append(&sample_event(now_secs, "uid-2")).unwrap();
        store.seal_all().unwrap();

        let graph = Arc::new(InMemoryGraphClient::new());
        let pipeline = SyncPipeline::new(graph.clone(), PipelineConfig::default());
        let rebuilder = Rebuilder::new(RebuildConfig { batch_size: 1, ..Default::default() });

        let report = rebuilder.run(&store, &pipeline, graph.as_ref(), &CancellationToken::new()).await.unwrap();
        assert!(report.ran);
        assert_eq!(report.batches_applied, 2);
        assert_eq!(graph.resource_count(), 2);
        assert_eq!(report.events_per_kind.get("ResourceAdded"), Some(&2));
    }

    #[tokio::test]
    async fn skips_rebuild_when_graph_already_has_a_node() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let graph = Arc::new(InMemoryGraphClient::new());
        graph.apply(&[crate::pipeline::mutation::MutationKind::MarkDeleted {
            uid: "pre-existing".to_string(),
            deleted_at: Timestamp::now(),
        }])
        .await
        .unwrap();

        let pipeline = SyncPipeline::new(graph.clone(), PipelineConfig::default());
        let rebuilder = Rebuilder::new(RebuildConfig::default());
        let report = rebuilder.run(&store, &pipeline, graph.as_ref(), &CancellationToken::new()).await.unwrap();
        assert!(!report.ran);
        assert_eq!(report.skipped_reason.as_deref(), Some("graph already has at least one node"));
    }

    /// Reproduces the scenario a broken chronological scan would get wrong:
    /// `ResourceAdded` lands in an older, sealed bucket and `ResourceModified`
    /// for the same `uid` lands in the following bucket, which stays open
    /// (never sealed). `UpsertResourceNode` only stamps `created_at` on
    /// first-insert, so replay order determines which event's timestamp wins
    /// — it must be the `Added` event's, per `spec.md` §8's replay-idempotence
    /// property.
    #[tokio::test]
    async fn rebuild_stamps_created_at_from_the_added_event_not_a_later_open_bucket_event() {
        let dir = TempDir::new().unwrap();
        let store = test_store_with_bucket(dir.path(), 100);
        let now_secs = Timestamp::now().as_secs();
        let added_secs = now_secs - 1000;
        let modified_secs = now_secs - 10;

        store.append(&sample_event(added_secs, "uid-1")).unwrap();
        store.append(&event_with_kind(modified_secs, "uid-1", EventKind::ResourceModified)).unwrap();
        // Deliberately no `seal_all()`: the second bucket stays open, matching
        // the normal post-rollover state this bug manifested in.

        let graph = Arc::new(InMemoryGraphClient::new());
        let pipeline = SyncPipeline::new(graph.clone(), PipelineConfig::default());
        let rebuilder = Rebuilder::new(RebuildConfig { batch_size: 1, ..Default::default() });

        let report = rebuilder.run(&store, &pipeline, graph.as_ref(), &CancellationToken::new()).await.unwrap();
        assert!(report.ran);
        let resource = graph.resource("uid-1").expect("resource replayed");
        assert_eq!(resource.created_at, Timestamp::from_secs(added_secs));
    }

    #[tokio::test]
    async fn skips_rebuild_when_disabled() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let graph = Arc::new(InMemoryGraphClient::new());
        let pipeline = SyncPipeline::new(graph.clone(), PipelineConfig::default());
        let rebuilder = Rebuilder::new(RebuildConfig { rebuild_on_start: false, ..Default::default() });
        let report = rebuilder.run(&store, &pipeline, graph.as_ref(), &CancellationToken::new()).await.unwrap();
        assert!(!report.ran);
    }
}
