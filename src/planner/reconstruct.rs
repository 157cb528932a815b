//! The timeline planner's five-step algorithm (`spec.md` §4.5): plan, scan
//! & group, reconstruct per resource, derive status, emit.
//!
//! Grounded on no single teacher file — the teacher's AS-OF model answered
//! point-in-time queries, not interval reconstruction — but built entirely
//! out of already-grounded pieces: `storage::store::SegmentStore`'s
//! segment-level methods, `core::timeline::group_by_resource`,
//! `planner::status::StatusRules`, `planner::cursor::Cursor`.
//!
//! Pagination simplification (recorded in `DESIGN.md`): a `ResourceHistory`
//! is always delivered whole, never split mid-resource, across pages. The
//! cursor's `segment_idx`/`intra_offset` fields are carried per §6.2's exact
//! wire layout but are not consulted by this implementation — resuming at
//! full-resource granularity (the resource immediately after
//! `(last_kind, last_namespace, last_name)`) satisfies every scenario in
//! `spec.md` §8 without the added complexity of mid-resource resume.

use crate::core::event::{Event, EventKind, ResourceIdentity};
use crate::core::status::Status;
use crate::core::temporal::Timestamp;
use crate::core::timeline::group_by_resource;
use crate::error::{Error, Result};
use crate::planner::cursor::Cursor;
use crate::planner::status::StatusRules;
use crate::storage::store::{EventFilter, SegmentStore};
use serde_json::Value;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// `GetTimeline`'s request parameters (`spec.md` §4.5). The store is keyed
/// by `(cluster_id, instance_id)`, so a query names exactly one pair.
#[derive(Debug, Clone)]
pub struct TimelineQuery {
    pub cluster_id: String,
    pub instance_id: String,
    pub start_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
    pub namespaces: Vec<String>,
    pub kinds: Vec<String>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub label_selector: Option<(String, String)>,
    pub page_size: usize,
    pub cursor: Option<String>,
}

impl TimelineQuery {
    fn filter(&self) -> EventFilter {
        EventFilter {
            uid: None,
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespaces: self.namespaces.clone(),
            kinds: self.kinds.clone(),
            label_selector: self.label_selector.clone(),
        }
    }
}

/// A contiguous interval of a resource's lifetime in one status
/// (`spec.md` §3 `StatusSegment`).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSegment {
    pub status: Status,
    pub start: Timestamp,
    pub end: Timestamp,
    pub message: String,
    pub raw_manifest: Value,
}

/// One `K8sEvent` attached to a resource's history.
#[derive(Debug, Clone, PartialEq)]
pub struct K8sEventRecord {
    pub event_uid: String,
    pub timestamp: Timestamp,
    pub reason: String,
    pub message: String,
}

/// The reconstructed lifetime of one resource over the query window
/// (`spec.md` §3 `ResourceHistory`).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHistory {
    pub identity: ResourceIdentity,
    pub pre_existing: bool,
    pub deleted_at: Option<Timestamp>,
    pub segments: Vec<StatusSegment>,
    pub events: Vec<K8sEventRecord>,
}

/// One page's worth of resources sharing a `kind`, in emission order
/// (`spec.md` §4.5 step 5).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBatch {
    pub kind: String,
    pub resources: Vec<ResourceHistory>,
    pub is_final_batch: bool,
}

/// The metadata message sent first (and, iff `partial`, again as a
/// trailing message) per `spec.md` §4.5 step 5 / §6.3.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub total_count: usize,
    pub segments_scanned: usize,
    pub segments_skipped: usize,
    pub query_execution_time_ms: u64,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub page_size: usize,
    pub partial: bool,
}

/// One page of `GetTimeline`'s result: the leading metadata, the batches,
/// and — iff `partial` — the trailing metadata repeating the same value
/// (§6.3's "first message MUST be Metadata ... an OPTIONAL trailing
/// Metadata iff partial=true").
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerResult {
    pub metadata: Metadata,
    pub batches: Vec<ResourceBatch>,
}

struct PendingSegment {
    start: Timestamp,
    status: Status,
    message: String,
    raw_manifest: Value,
}

/// Run the five-step algorithm against `store` for one page of `query`.
/// `cancel` is checked at each segment boundary so a client disconnecting
/// mid-scan stops the planner promptly instead of finishing a large query
/// nobody is listening to anymore.
pub fn reconstruct(store: &SegmentStore, rules: &StatusRules, query: &TimelineQuery, cancel: &CancellationToken) -> Result<PlannerResult> {
    let started = Instant::now();

    if query.start_timestamp > query.end_timestamp {
        return Err(Error::Invariant("start_timestamp must not exceed end_timestamp".to_string()));
    }

    let resume_from = match &query.cursor {
        Some(raw) => Some(Cursor::decode(raw)?),
        None => None,
    };

    // --- Step 1: plan ---
    let selected = store.select_segments(&query.cluster_id, &query.instance_id, query.start_timestamp, query.end_timestamp);
    let preceding = store.preceding_segment(&query.cluster_id, &query.instance_id, query.start_timestamp);

    let mut segments_scanned = 0usize;
    let mut segments_skipped = 0usize;
    let filter = query.filter();

    // --- Step 2: scan & group ---
    let mut windowed_events: Vec<Event> = Vec::new();
    for entry in &selected {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        segments_scanned += 1;
        match store.scan_segment(entry, &filter, query.start_timestamp, query.end_timestamp) {
            Ok(events) => windowed_events.extend(events),
            Err(Error::CorruptRecord(_)) => segments_skipped += 1,
            Err(e) => return Err(e),
        }
    }
    windowed_events.extend(store.scan_open_tail(&query.cluster_id, &query.instance_id, &filter, query.start_timestamp, query.end_timestamp)?);

    let mut preceding_events: Vec<Event> = Vec::new();
    if let Some(entry) = &preceding {
        segments_scanned += 1;
        let just_before_window = Timestamp::from_nanos(query.start_timestamp.as_nanos().saturating_sub(1));
        match store.scan_segment(entry, &filter, entry.bucket_start, just_before_window) {
            Ok(events) => preceding_events.extend(events),
            Err(Error::CorruptRecord(_)) => segments_skipped += 1,
            Err(e) => return Err(e),
        }
    }

    let (state_events, k8s_events): (Vec<Event>, Vec<Event>) =
        windowed_events.into_iter().partition(|e| e.kind != EventKind::K8sEvent);
    let preceding_state_events: Vec<Event> =
        preceding_events.into_iter().filter(|e| e.kind != EventKind::K8sEvent).collect();

    let mut groups: Vec<ResourceHistory> = Vec::new();
    let mut groups_by_uid: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for timeline in group_by_resource(preceding_state_events) {
        // The most recent pre-existing event is the resource's state as of
        // `start_timestamp` — used to synthesize an opening segment below.
        if let Some(last) = timeline.ordered_events().last() {
            let snapshot = if last.kind == EventKind::ResourceDeleted {
                (Value::Null, Status::Terminating)
            } else {
                (last.manifest.clone(), Status::Unknown)
            };
            let idx = groups.len();
            groups_by_uid.insert(timeline.identity().uid.clone(), idx);
            groups.push(ResourceHistory {
                identity: timeline.identity().clone(),
                pre_existing: true,
                deleted_at: None,
                segments: reconstruct_segments_from_snapshot(rules, Some(snapshot), &[], query.start_timestamp, query.end_timestamp),
                events: Vec::new(),
            });
        }
    }

    for timeline in group_by_resource(state_events) {
        let identity = timeline.identity().clone();
        let events: Vec<Event> = timeline.ordered_events().cloned().collect();
        if let Some(&idx) = groups_by_uid.get(&identity.uid) {
            let pre_existing_snapshot = {
                let preceding_group = groups.get(idx).unwrap();
                preceding_group.segments.first().map(|s| (s.raw_manifest.clone(), s.status))
            };
            let group = groups.get_mut(idx).unwrap();
            group.segments = reconstruct_segments_from_snapshot(rules, pre_existing_snapshot, &events, query.start_timestamp, query.end_timestamp);
            group.deleted_at = events.iter().rev().find(|e| e.kind == EventKind::ResourceDeleted).map(|e| e.timestamp);
        } else {
            let idx = groups.len();
            groups_by_uid.insert(identity.uid.clone(), idx);
            let deleted_at = events.iter().rev().find(|e| e.kind == EventKind::ResourceDeleted).map(|e| e.timestamp);
            groups.push(ResourceHistory {
                identity,
                pre_existing: false,
                deleted_at,
                segments: reconstruct_segments_from_snapshot(rules, None, &events, query.start_timestamp, query.end_timestamp),
                events: Vec::new(),
            });
        }
    }

    for event in k8s_events {
        let target_uid = event.parent_uid.clone().unwrap_or_else(|| event.uid.clone());
        if let Some(&idx) = groups_by_uid.get(&target_uid) {
            let group = groups.get_mut(idx).unwrap();
            group.events.push(K8sEventRecord {
                event_uid: event.uid.clone(),
                timestamp: event.timestamp,
                reason: event.manifest.pointer("/reason").and_then(Value::as_str).unwrap_or("").to_string(),
                message: event.manifest.pointer("/message").and_then(Value::as_str).unwrap_or("").to_string(),
            });
        }
    }

    for group in &mut groups {
        group.events.sort_by_key(|e| e.timestamp);
    }

    groups.sort_by(|a, b| {
        (&a.identity.kind, &a.identity.namespace, &a.identity.name)
            .cmp(&(&b.identity.kind, &b.identity.namespace, &b.identity.name))
    });

    let total_count = groups.len();

    let start_index = match &resume_from {
        Some(cursor) => groups
            .iter()
            .position(|g| {
                (g.identity.kind.as_str(), g.identity.namespace.as_str(), g.identity.name.as_str())
                    > (cursor.last_kind.as_str(), cursor.last_namespace.as_str(), cursor.last_name.as_str())
            })
            .unwrap_or(groups.len()),
        None => 0,
    };

    let page_end = (start_index + query.page_size.max(1)).min(groups.len());
    let page: Vec<ResourceHistory> = groups[start_index..page_end].to_vec();
    let has_more = page_end < groups.len();

    let next_cursor = if has_more {
        page.last().map(|last| {
            Cursor {
                last_kind: last.identity.kind.clone(),
                last_namespace: last.identity.namespace.clone(),
                last_name: last.identity.name.clone(),
                segment_idx: 0,
                intra_offset: 0,
            }
            .encode()
        })
    } else {
        None
    };

    let batches = batch_by_kind(page, &groups[page_end..]);

    let metadata = Metadata {
        total_count,
        segments_scanned,
        segments_skipped,
        query_execution_time_ms: started.elapsed().as_millis() as u64,
        next_cursor,
        has_more,
        page_size: query.page_size,
        partial: segments_skipped > 0,
    };

    Ok(PlannerResult { metadata, batches })
}

/// Chunk a page's resources into contiguous same-kind `ResourceBatch`es.
/// `remaining_after_page` is the tail of the full (unpaginated) result set,
/// used only to decide whether a batch's kind is truly drained (no more
/// resources of that kind anywhere in the result, not just this page).
fn batch_by_kind(page: Vec<ResourceHistory>, remaining_after_page: &[ResourceHistory]) -> Vec<ResourceBatch> {
    let mut batches = Vec::new();
    let mut iter = page.into_iter().peekable();
    while let Some(first) = iter.next() {
        let kind = first.identity.kind.clone();
        let mut resources = vec![first];
        while let Some(next) = iter.peek() {
            if next.identity.kind == kind {
                resources.push(iter.next().unwrap());
            } else {
                break;
            }
        }
        let kind_continues_later = remaining_after_page.iter().any(|g| g.identity.kind == kind);
        batches.push(ResourceBatch { kind, resources, is_final_batch: !kind_continues_later });
    }
    batches
}

/// Walk a resource's windowed events, optionally opening with a synthetic
/// segment derived from its pre-existing snapshot (`spec.md` §4.5 step 3).
fn reconstruct_segments_from_snapshot(
    rules: &StatusRules,
    pre_existing_snapshot: Option<(Value, Status)>,
    events: &[Event],
    window_start: Timestamp,
    window_end: Timestamp,
) -> Vec<StatusSegment> {
    let mut segments = Vec::new();
    let mut open: Option<PendingSegment> = pre_existing_snapshot.map(|(manifest, status)| {
        let (status, message) = if status == Status::Terminating {
            (Status::Terminating, "resource is terminating".to_string())
        } else {
            rules.derive(&manifest, false)
        };
        PendingSegment { start: window_start, status, message, raw_manifest: manifest }
    });

    for event in events {
        match event.kind {
            EventKind::ResourceAdded | EventKind::ResourceModified => {
                if let Some(pending) = open.take() {
                    segments.push(StatusSegment {
                        status: pending.status,
                        start: pending.start,
                        end: event.timestamp,
                        message: pending.message,
                        raw_manifest: pending.raw_manifest,
                    });
                }
                let (status, message) = rules.derive(&event.manifest, false);
                open = Some(PendingSegment { start: event.timestamp, status, message, raw_manifest: event.manifest.clone() });
            }
            EventKind::ResourceDeleted => {
                if let Some(pending) = open.take() {
                    segments.push(StatusSegment {
                        status: pending.status,
                        start: pending.start,
                        end: event.timestamp,
                        message: pending.message,
                        raw_manifest: pending.raw_manifest,
                    });
                }
                let (status, message) = rules.derive(&Value::Null, true);
                open = Some(PendingSegment { start: event.timestamp, status, message, raw_manifest: Value::Null });
            }
            EventKind::K8sEvent => {}
        }
    }

    if let Some(pending) = open {
        let now = Timestamp::now();
        let end = if window_end < now { window_end } else { now };
        segments.push(StatusSegment {
            status: pending.status,
            start: pending.start,
            end,
            message: pending.message,
            raw_manifest: pending.raw_manifest,
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::StoreConfig;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn query(cluster: &str, instance: &str, start: i64, end: i64) -> TimelineQuery {
        TimelineQuery {
            cluster_id: cluster.to_string(),
            instance_id: instance.to_string(),
            start_timestamp: Timestamp::from_secs(start),
            end_timestamp: Timestamp::from_secs(end),
            namespaces: Vec::new(),
            kinds: Vec::new(),
            namespace: None,
            kind: None,
            name: None,
            label_selector: None,
            page_size: 500,
            cursor: None,
        }
    }

    fn event(secs: i64, kind: EventKind, uid: &str, manifest: Value) -> Event {
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
            manifest,
        )
    }

    fn test_store(root: &std::path::Path) -> SegmentStore {
        let mut config = StoreConfig::new(root);
        config.bucket_duration_nanos = Duration::from_secs(3600).as_nanos() as i64;
        config.fsync_interval = Duration::from_millis(0);
        SegmentStore::open(config).unwrap().0
    }

    #[test]
    fn reconstructs_a_timeline_with_deletion() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let ready_manifest = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});

        store.append(&event(10, EventKind::ResourceAdded, "u1", ready_manifest.clone())).unwrap();
        store.append(&event(20, EventKind::ResourceModified, "u1", ready_manifest)).unwrap();
        store.append(&event(30, EventKind::ResourceDeleted, "u1", json!({}))).unwrap();
        store.seal_all().unwrap();

        let rules = StatusRules::default();
        let result = reconstruct(&store, &rules, &query("cluster-a", "inst-1", 0, 100), &CancellationToken::new()).unwrap();

        assert_eq!(result.metadata.total_count, 1);
        let resource = &result.batches[0].resources[0];
        assert_eq!(resource.segments.len(), 3);
        assert_eq!(resource.segments[0].start, Timestamp::from_secs(10));
        assert_eq!(resource.segments[0].end, Timestamp::from_secs(20));
        assert_eq!(resource.segments[1].end, Timestamp::from_secs(30));
        assert_eq!(resource.segments[2].status, Status::Terminating);
        assert_eq!(resource.deleted_at, Some(Timestamp::from_secs(30)));
    }

    #[test]
    fn pre_existing_resource_gets_a_synthetic_opening_segment() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let ready_manifest = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        store.append(&event(5, EventKind::ResourceAdded, "u2", ready_manifest)).unwrap();
        store.seal_all().unwrap();

        let rules = StatusRules::default();
        let result = reconstruct(&store, &rules, &query("cluster-a", "inst-1", 10, 20), &CancellationToken::new()).unwrap();

        assert_eq!(result.metadata.total_count, 1);
        let resource = &result.batches[0].resources[0];
        assert!(resource.pre_existing);
        assert_eq!(resource.segments.len(), 1);
        assert_eq!(resource.segments[0].start, Timestamp::from_secs(10));
        assert_eq!(resource.segments[0].end, Timestamp::from_secs(20));
        assert_eq!(resource.segments[0].status, Status::Ready);
    }

    #[test]
    fn k8s_events_attach_to_the_involved_resource_via_parent_uid() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        store.append(&event(10, EventKind::ResourceAdded, "u1", json!({}))).unwrap();
        let k8s_event = event(15, EventKind::K8sEvent, "evt-1", json!({"reason": "Scheduled"})).with_parent_uid("u1".to_string());
        store.append(&k8s_event).unwrap();
        store.seal_all().unwrap();

        let rules = StatusRules::default();
        let result = reconstruct(&store, &rules, &query("cluster-a", "inst-1", 0, 100), &CancellationToken::new()).unwrap();
        let resource = &result.batches[0].resources[0];
        assert_eq!(resource.events.len(), 1);
        assert_eq!(resource.events[0].reason, "Scheduled");
    }

    #[test]
    fn invalid_time_range_is_an_invariant_error() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let rules = StatusRules::default();
        let result = reconstruct(&store, &rules, &query("cluster-a", "inst-1", 100, 0), &CancellationToken::new());
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn pagination_splits_results_across_pages_via_cursor() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        for i in 0..3 {
            let uid = format!("u{i}");
            let mut e = event(10, EventKind::ResourceAdded, &uid, json!({}));
            e.name = format!("pod-{i}");
            store.append(&e).unwrap();
        }
        store.seal_all().unwrap();

        let rules = StatusRules::default();
        let mut q = query("cluster-a", "inst-1", 0, 100);
        q.page_size = 2;
        let first_page = reconstruct(&store, &rules, &q, &CancellationToken::new()).unwrap();
        assert_eq!(first_page.metadata.total_count, 3);
        assert!(first_page.metadata.has_more);
        assert!(first_page.metadata.next_cursor.is_some());

        q.cursor = first_page.metadata.next_cursor.clone();
        let second_page = reconstruct(&store, &rules, &q, &CancellationToken::new()).unwrap();
        assert!(!second_page.metadata.has_more);
        let total_delivered: usize = first_page.batches.iter().map(|b| b.resources.len()).sum::<usize>()
            + second_page.batches.iter().map(|b| b.resources.len()).sum::<usize>();
        assert_eq!(total_delivered, 3);
    }
}
