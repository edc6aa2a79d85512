// ── Mnemo Engine: Job Runner ────────────────────────────────────────────────
//
// Pluggable execution backend for background work (the enrichment pipeline,
// purge sweeps). Three modes:
//
//   inline — run in the caller's context, awaited to completion. Tests and
//            low-volume hosts; makes enrichment synchronous and deterministic.
//   task   — fire-and-forget tokio task. The default for interactive agents.
//   queue  — hand the job off to a durable queue (opaque to the core; the
//            queue owns execution and retries).
//
// Background errors are logged, never propagated — a failed enrichment step
// must not take the write path down with it.

use crate::atoms::error::EngineResult;
use futures::future::join_all;
use log::warn;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A unit of background work.
pub type JobFuture = Pin<Box<dyn Future<Output = EngineResult<()>> + Send>>;

/// Durable queue handoff contract. The queue decides where and when the job
/// actually runs.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, name: &str, job: JobFuture) -> EngineResult<()>;
}

#[derive(Clone)]
enum Backend {
    Inline,
    Task,
    Queue(Arc<dyn JobQueue>),
}

/// Background job dispatcher.
#[derive(Clone)]
pub struct JobRunner {
    backend: Backend,
}

impl JobRunner {
    /// Synchronous execution in the caller's context.
    pub fn inline() -> Self {
        Self { backend: Backend::Inline }
    }

    /// Fire-and-forget tokio tasks.
    pub fn task() -> Self {
        Self { backend: Backend::Task }
    }

    /// Durable queue handoff.
    pub fn queue(queue: Arc<dyn JobQueue>) -> Self {
        Self { backend: Backend::Queue(queue) }
    }

    /// Parse the configured backend name (`inline | task | queue` — queue
    /// requires a handle and is constructed via [`JobRunner::queue`]).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "inline" => Some(Self::inline()),
            "task" | "thread" => Some(Self::task()),
            _ => None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Inline => "inline",
            Backend::Task => "task",
            Backend::Queue(_) => "queue",
        }
    }

    /// Dispatch one job. Inline awaits it; task and queue return immediately.
    /// The job's error is logged under `name`, never returned.
    pub async fn spawn(&self, name: &str, job: JobFuture) {
        match &self.backend {
            Backend::Inline => {
                if let Err(e) = job.await {
                    warn!("[jobs] {name} failed: {e}");
                }
            }
            Backend::Task => {
                let name = name.to_string();
                tokio::spawn(async move {
                    if let Err(e) = job.await {
                        warn!("[jobs] {name} failed: {e}");
                    }
                });
            }
            Backend::Queue(queue) => {
                if let Err(e) = queue.enqueue(name, job) {
                    warn!("[jobs] {name} handoff failed: {e}");
                }
            }
        }
    }

    /// Fan-out helper: run all jobs and wait for every one to finish.
    /// Concurrent when the backend supports it, serial for inline. Errors
    /// are logged per job, never returned.
    pub async fn join_parallel(&self, jobs: Vec<(&'static str, JobFuture)>) {
        match &self.backend {
            Backend::Inline => {
                for (name, job) in jobs {
                    if let Err(e) = job.await {
                        warn!("[jobs] {name} failed: {e}");
                    }
                }
            }
            _ => {
                let wrapped = jobs.into_iter().map(|(name, job)| async move {
                    if let Err(e) = job.await {
                        warn!("[jobs] {name} failed: {e}");
                    }
                });
                join_all(wrapped).await;
            }
        }
    }
}
