//! C7: wires every other component into a running service and owns its
//! startup/shutdown sequence (`spec.md` §4.7).
//!
//! Grounded on the teacher's `main.rs`, which opened the journal, built the
//! materialized view, then started the API server in that order and tore
//! them down in reverse on `ctrl_c`; this orchestrator generalizes that
//! same shape to the seven components `spec.md` §4.7 lists.

use crate::config::Config;
use crate::core::event::Event;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::listener::{Batch, Listener};
use crate::pipeline::graph::{GraphClient, Neo4jGraphClient};
use crate::pipeline::SyncPipeline;
use crate::planner::grpc::proto::timeline_service_server::TimelineServiceServer;
use crate::planner::{StatusRules, TimelinePlanner};
use crate::rebuild::{RebuildReport, Rebuilder};
use crate::storage::store::SegmentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

/// Ping backoff for the initial graph connection (`spec.md` §4.7 step 2):
/// 20 attempts, doubling from 500ms, capped at 10s. No backoff crate exists
/// anywhere in the retrieved corpus, so this is hand-rolled, the same way
/// `pipeline::pipeline`'s retry ladder is.
const PING_MAX_ATTEMPTS: usize = 20;
const PING_INITIAL_DELAY_MS: u64 = 500;
const PING_CAP_MS: u64 = 10_000;

fn ping_backoff_delay(attempt: usize) -> Duration {
    let ms = PING_INITIAL_DELAY_MS.saturating_mul(1u64 << attempt.min(20)).min(PING_CAP_MS);
    Duration::from_millis(ms)
}

async fn ping_with_backoff(graph: &dyn GraphClient) -> Result<()> {
    let mut attempt = 0;
    loop {
        match graph.ping().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < PING_MAX_ATTEMPTS => {
                let delay = ping_backoff_delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "graph not reachable yet, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(Error::Fatal(format!("graph unreachable after {PING_MAX_ATTEMPTS} attempts: {e}"))),
        }
    }
}

/// Everything a running service holds, started in the order `spec.md`
/// §4.7 specifies and stopped in reverse.
pub struct Service {
    store: Arc<SegmentStore>,
    listener: Arc<Listener>,
    pipeline: Arc<SyncPipeline>,
    graph: Arc<dyn GraphClient>,
    grpc_bind_addr: String,
    cancel: CancellationToken,
    grpc_handle: Option<JoinHandle<()>>,
}

impl Service {
    /// Steps 1-6 of `spec.md` §4.7: connect, ping-with-backoff, init
    /// schema, open the segment store (replaying any crash-recovered
    /// events straight into the pipeline), start the listener, and
    /// optionally rebuild.
    pub async fn bootstrap(config: &Config) -> Result<(Self, RebuildReport)> {
        let graph: Arc<dyn GraphClient> =
            Arc::new(Neo4jGraphClient::connect(&config.graph.uri, &config.graph.user, &config.graph.password).await?);
        ping_with_backoff(graph.as_ref()).await?;
        graph.init_schema().await?;
        info!("graph schema initialized");

        let (store, recovered) = SegmentStore::open(config.store_config())?;
        let store = Arc::new(store);
        if !recovered.is_empty() {
            info!(count = recovered.len(), "replaying crash-recovered events into the graph");
        }

        let pipeline = Arc::new(SyncPipeline::new(graph.clone(), config.pipeline_config()));
        if !recovered.is_empty() {
            replay_recovered(&pipeline, recovered).await;
        }

        let listener = Arc::new(Listener::new(config.batcher_config()));
        let batches = listener.subscribe()?;
        listener.start()?;
        pipeline.start(batches);

        let rules = Arc::new(StatusRules::new(config.pipeline.transient_causes.clone()));
        let rebuilder = Rebuilder::new(config.rebuild_config());
        let cancel = CancellationToken::new();
        let rebuild_report = rebuilder.run(&store, &pipeline, graph.as_ref(), &cancel).await?;

        let grpc_planner = TimelinePlanner::new(store.clone(), rules);
        let grpc_bind_addr = config.grpc.bind_addr.clone();
        let grpc_handle = spawn_grpc_server(grpc_planner, &grpc_bind_addr, cancel.clone())?;

        Ok((
            Self { store, listener, pipeline, graph, grpc_bind_addr, cancel, grpc_handle: Some(grpc_handle) },
            rebuild_report,
        ))
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// Reverse-order, best-effort shutdown (`spec.md` §4.7's teardown
    /// note): stop taking new events first, drain the pipeline, close the
    /// gRPC server last so in-flight queries finish against a store that's
    /// no longer being written to mid-query.
    pub async fn shutdown(mut self) {
        info!(bind_addr = %self.grpc_bind_addr, "shutting down");
        self.cancel.cancel();
        if let Some(handle) = self.grpc_handle.take() {
            let _ = handle.await;
        }
        if let Err(e) = self.listener.stop().await {
            warn!(error = %e, "listener stop reported an error");
        }
        self.pipeline.stop().await;
        if let Err(e) = self.store.seal_all() {
            warn!(error = %e, "final seal_all reported an error");
        }
        let _ = self.graph;
    }
}

async fn replay_recovered(pipeline: &SyncPipeline, events: Vec<Event>) {
    let batch = Batch { batch_id: "crash-recovery".to_string(), events, created_at: Timestamp::now() };
    let _ = pipeline.process_batch(&batch).await;
}

fn spawn_grpc_server(planner: TimelinePlanner, bind_addr: &str, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let addr = bind_addr.parse().map_err(|e| Error::Invariant(format!("invalid grpc bind address: {e}")))?;
    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = Server::builder()
            .add_service(TimelineServiceServer::new(planner))
            .serve_with_shutdown(addr, shutdown)
            .await
        {
            warn!(error = %e, "grpc server exited with an error");
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_backoff_schedule_doubles_and_caps() {
        assert_eq!(ping_backoff_delay(0), Duration::from_millis(500));
        assert_eq!(ping_backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(ping_backoff_delay(5), Duration::from_millis(PING_CAP_MS));
    }
}
