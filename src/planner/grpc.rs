//! The `TimelineService` gRPC server (`spec.md` §6.3): wraps
//! `planner::reconstruct`'s one-page-at-a-time output in a server-streaming
//! RPC using `async-stream`, the same streaming idiom the teacher's
//! `bpmn-lite-server` used for its own lifecycle-event tail (grounded on
//! `examples/adamtc007-ob-poc/bpmn-lite/bpmn-lite-server/src/grpc.rs`,
//! though that teacher reached for `tokio_stream::wrappers::ReceiverStream`
//! over a spawned task; `async-stream`'s `try_stream!` fits a single
//! synchronous compute-then-emit RPC like this one without the extra
//! channel and task).
//!
//! Terminal RPC errors are reserved for `Invariant` (bad time range,
//! malformed cursor) and `Fatal`; every other failure surfaces as
//! `partial=true` in the trailing `Metadata` instead of aborting the stream
//! (`spec.md` §7's user-visible failure behaviour), via `Error`'s existing
//! `From<Error> for tonic::Status` impl.

use crate::core::temporal::Timestamp;
use crate::planner::reconstruct::{self, Metadata, PlannerResult, ResourceBatch, ResourceHistory, StatusSegment, TimelineQuery};
use crate::planner::status::StatusRules;
use crate::storage::store::SegmentStore;
use async_stream::try_stream;
use std::pin::Pin;
use std::sync::Arc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status as TonicStatus};

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("spectre.v1");
}

use proto::timeline_chunk::Payload;
use proto::timeline_service_server::TimelineService;
use proto::{
    K8sEvent as ProtoK8sEvent, Metadata as ProtoMetadata, ResourceBatch as ProtoResourceBatch,
    ResourceHistory as ProtoResourceHistory, ResourceIdentity as ProtoResourceIdentity, Status as ProtoStatus,
    StatusSegment as ProtoStatusSegment, TimelineChunk, TimelineRequest,
};

/// The `TimelineService` implementation, holding the shared segment store
/// and status rules every query is reconstructed against.
pub struct TimelinePlanner {
    store: Arc<SegmentStore>,
    rules: Arc<StatusRules>,
}

impl TimelinePlanner {
    pub fn new(store: Arc<SegmentStore>, rules: Arc<StatusRules>) -> Self {
        Self { store, rules }
    }
}

fn from_proto_request(req: TimelineRequest) -> Result<TimelineQuery, TonicStatus> {
    if req.cluster_id.is_empty() || req.instance_id.is_empty() {
        return Err(TonicStatus::invalid_argument("cluster_id and instance_id are required"));
    }
    Ok(TimelineQuery {
        cluster_id: req.cluster_id,
        instance_id: req.instance_id,
        start_timestamp: Timestamp::from_nanos(req.start_timestamp_nanos),
        end_timestamp: Timestamp::from_nanos(req.end_timestamp_nanos),
        namespaces: req.namespaces,
        kinds: req.kinds,
        namespace: req.namespace,
        kind: req.kind,
        name: req.name,
        label_selector: req.label_selector.map(|l| (l.key, l.value)),
        page_size: req.page_size.max(1) as usize,
        cursor: req.cursor,
    })
}

fn to_proto_status(status: crate::core::status::Status) -> i32 {
    use crate::core::status::Status::*;
    (match status {
        Ready => ProtoStatus::StatusReady,
        Warning => ProtoStatus::StatusWarning,
        Error => ProtoStatus::StatusError,
        Terminating => ProtoStatus::StatusTerminating,
        Unknown => ProtoStatus::StatusUnknown,
    }) as i32
}

fn to_proto_segment(segment: StatusSegment) -> ProtoStatusSegment {
    ProtoStatusSegment {
        status: to_proto_status(segment.status),
        start_timestamp_nanos: segment.start.as_nanos(),
        end_timestamp_nanos: segment.end.as_nanos(),
        message: segment.message,
        raw_manifest: serde_json::to_vec(&segment.raw_manifest).unwrap_or_default(),
    }
}

fn to_proto_resource(resource: ResourceHistory) -> ProtoResourceHistory {
    ProtoResourceHistory {
        identity: Some(ProtoResourceIdentity {
            api_version: resource.identity.api_version,
            kind: resource.identity.kind,
            namespace: resource.identity.namespace,
            name: resource.identity.name,
            uid: resource.identity.uid,
        }),
        pre_existing: resource.pre_existing,
        deleted_at_nanos: resource.deleted_at.map(|ts| ts.as_nanos()),
        segments: resource.segments.into_iter().map(to_proto_segment).collect(),
        events: resource
            .events
            .into_iter()
            .map(|e| ProtoK8sEvent {
                event_uid: e.event_uid,
                timestamp_nanos: e.timestamp.as_nanos(),
                reason: e.reason,
                message: e.message,
            })
            .collect(),
    }
}

fn to_proto_batch(batch: ResourceBatch) -> ProtoResourceBatch {
    ProtoResourceBatch {
        kind: batch.kind,
        resources: batch.resources.into_iter().map(to_proto_resource).collect(),
        is_final_batch: batch.is_final_batch,
    }
}

fn to_proto_metadata(metadata: &Metadata) -> ProtoMetadata {
    ProtoMetadata {
        total_count: metadata.total_count as u64,
        segments_scanned: metadata.segments_scanned as u64,
        segments_skipped: metadata.segments_skipped as u64,
        query_execution_time_ms: metadata.query_execution_time_ms,
        next_cursor: metadata.next_cursor.clone(),
        has_more: metadata.has_more,
        page_size: metadata.page_size as u32,
        partial: metadata.partial,
    }
}

fn chunks_for(result: PlannerResult) -> Vec<TimelineChunk> {
    let mut chunks = Vec::with_capacity(result.batches.len() + 2);
    chunks.push(TimelineChunk { payload: Some(Payload::Metadata(to_proto_metadata(&result.metadata))) });
    let partial = result.metadata.partial;
    for batch in result.batches {
        chunks.push(TimelineChunk { payload: Some(Payload::ResourceBatch(to_proto_batch(batch))) });
    }
    if partial {
        chunks.push(TimelineChunk { payload: Some(Payload::Metadata(to_proto_metadata(&result.metadata))) });
    }
    chunks
}

#[tonic::async_trait]
impl TimelineService for TimelinePlanner {
    type GetTimelineStream = Pin<Box<dyn futures::Stream<Item = Result<TimelineChunk, TonicStatus>> + Send + 'static>>;

    async fn get_timeline(&self, request: Request<TimelineRequest>) -> Result<Response<Self::GetTimelineStream>, TonicStatus> {
        let query = from_proto_request(request.into_inner())?;
        let store = self.store.clone();
        let rules = self.rules.clone();
        let cancel = CancellationToken::new();

        let stream = try_stream! {
            let result = reconstruct::reconstruct(&store, &rules, &query, &cancel)?;
            for chunk in chunks_for(result) {
                yield chunk;
            }
        };

        Ok(Response::new(Box::pin(stream.map_err(TonicStatus::from)) as Self::GetTimelineStream))
    }
}
