//! C4 sync pipeline: drains `listener::BatchStream`, derives mutations for
//! every event in a batch, and applies them to the graph with retry
//! (`spec.md` §4.4).
//!
//! Grounded on the teacher's `db.rs` run-loop shape (a state flag plus a
//! spawned background task the public API starts/stops), generalized from
//! its single-writer loop to a bounded-concurrency consumer driven by
//! `tokio::sync::Semaphore`.

use crate::listener::{Batch, BatchStream};
use crate::pipeline::graph::GraphClient;
use crate::pipeline::mutation::derive_mutations;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry ladder for transient graph errors (`spec.md` §4.4): five
/// attempts, doubling from 250ms and capped at 10s. No backoff crate
/// exists anywhere in the retrieved corpus, so this is hand-rolled.
const BACKOFF_SCHEDULE_MS: [u64; 5] = [250, 500, 1_000, 2_000, 4_000];
const BACKOFF_CAP_MS: u64 = 10_000;
const MAX_ATTEMPTS: usize = 5;

fn backoff_delay(attempt: usize) -> Duration {
    let ms = BACKOFF_SCHEDULE_MS.get(attempt).copied().unwrap_or(BACKOFF_CAP_MS).min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Tunables surfaced through `config::Config`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Config's transient-cause keyword list, fed to `derive_mutations`'s
    /// status derivation (`core::status::derive_status`).
    pub transient_causes: Vec<String>,
    /// Upper bound on batches applied to the graph concurrently.
    pub graph_max_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { transient_causes: crate::core::status::default_transient_causes(), graph_max_concurrency: 4 }
    }
}

/// Running counters surfaced for diagnostics/metrics.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub batches_applied: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub events_processed: AtomicU64,
}

/// Drains batches from C3 and applies their derived mutations to the
/// graph, `graph_max_concurrency`-bounded, retrying transient failures and
/// dropping (logging) non-transient ones without halting the pipeline.
pub struct SyncPipeline {
    graph: Arc<dyn GraphClient>,
    config: PipelineConfig,
    state: Arc<Mutex<PipelineState>>,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncPipeline {
    pub fn new(graph: Arc<dyn GraphClient>, config: PipelineConfig) -> Self {
        Self {
            graph,
            config,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            cancel: CancellationToken::new(),
            stats: Arc::new(PipelineStats::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Derive and apply one batch's mutations directly, outside the
    /// channel-driven consume loop. The rebuilder (C6) calls this for each
    /// synthetic batch it assembles from replayed segments, reusing the
    /// exact same retry/drop semantics a live batch gets from C3.
    pub async fn process_batch(&self, batch: &Batch) -> BatchOutcome {
        apply_batch_with_retry(batch, self.graph.as_ref(), &self.config.transient_causes, &self.stats).await
    }

    /// Begin consuming `batches` in the background. Transitions
    /// `Idle -> Running`.
    pub fn start(&self, batches: BatchStream) {
        *self.state.lock().unwrap() = PipelineState::Running;
        let graph = self.graph.clone();
        let transient_causes = self.config.transient_causes.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.graph_max_concurrency.max(1)));
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            run_consume_loop(batches, graph, transient_causes, semaphore, cancel, stats).await;
            *state.lock().unwrap() = PipelineState::Stopped;
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stop accepting new batches (transition to `Draining`) and wait for
    /// in-flight applies to finish, then `Stopped`. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == PipelineState::Running {
                *state = PipelineState::Draining;
            }
        }
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.state.lock().unwrap() = PipelineState::Stopped;
    }
}

async fn run_consume_loop(
    mut batches: BatchStream,
    graph: Arc<dyn GraphClient>,
    transient_causes: Vec<String>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("sync pipeline draining: cancellation observed");
                break;
            }
            next = batches.next() => {
                match next {
                    Some(batch) => {
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let graph = graph.clone();
                        let transient_causes = transient_causes.clone();
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            let _ = apply_batch_with_retry(&batch, graph.as_ref(), &transient_causes, &stats).await;
                        });
                    }
                    None => break,
                }
            }
        }
    }
}

/// What became of one batch's apply attempt — the rebuilder uses this to
/// tally per-kind counts; the consume loop only cares about the stats
/// counters, already updated as a side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// No mutations to apply (e.g. an empty batch).
    Empty,
    Applied,
    Dropped,
}

async fn apply_batch_with_retry(
    batch: &Batch,
    graph: &dyn GraphClient,
    transient_causes: &[String],
    stats: &PipelineStats,
) -> BatchOutcome {
    let mutations: Vec<_> = batch
        .events
        .iter()
        .flat_map(|event| derive_mutations(event, transient_causes))
        .collect();

    if mutations.is_empty() {
        return BatchOutcome::Empty;
    }

    let mut attempt = 0;
    loop {
        match graph.apply(&mutations).await {
            Ok(()) => {
                stats.batches_applied.fetch_add(1, Ordering::Relaxed);
                stats.events_processed.fetch_add(batch.events.len() as u64, Ordering::Relaxed);
                return BatchOutcome::Applied;
            }
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS - 1 => {
                let delay = backoff_delay(attempt);
                warn!(batch_id = %batch.batch_id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transient graph error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(batch_id = %batch.batch_id, error = %e, attempts = attempt + 1, "dropping batch after exhausting retries or on non-transient error");
                return BatchOutcome::Dropped;
            }
        }
    }
}
