//! In-process job queue.
//!
//! Each named queue runs at most `controller.parallelism(queue)` jobs at a
//! time, so the concurrency controller takes effect on the next dispatch.
//! Failed jobs are retried with exponential backoff until their attempts are
//! used up.

use async_trait::async_trait;
use dashmap::DashMap;
use dbsnap_core::jobs::{JobId, JobOptions, JobQueue, QueueCounts, QueueMetrics};
use dbsnap_core::scaling::ConcurrencyController;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// How often the dispatcher re-reads parallelism when nothing is enqueued.
const IDLE_POLL: Duration = Duration::from_secs(1);

struct QueuedJob {
    id: JobId,
    payload: Value,
    options: JobOptions,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<QueuedJob>,
    active: usize,
    delayed: usize,
    failed: u64,
}

pub struct LocalQueue {
    queues: DashMap<String, QueueState>,
    handlers: DashMap<String, Handler>,
    controller: Arc<ConcurrencyController>,
    wake: Notify,
}

impl LocalQueue {
    pub fn new(controller: Arc<ConcurrencyController>) -> Self {
        Self {
            queues: DashMap::new(),
            handlers: DashMap::new(),
            controller,
            wake: Notify::new(),
        }
    }

    /// Installs the processor for `queue` and puts the queue under the controller.
    pub fn register<F, Fut>(&self, queue: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());
        self.handlers.insert(queue.to_string(), handler);
        self.queues.entry(queue.to_string()).or_default();
        self.controller.manage(queue);
        self.wake.notify_one();
    }

    /// Dispatches jobs until `cancel` fires. Jobs already running are left to finish.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.dispatch_ready();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            tracing::info!("Job dispatcher stopped");
        })
    }

    /// Waits until no job is running or `timeout` elapses; returns whether the queues drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let busy: usize = self.queues.iter().map(|q| q.active).sum();
            if busy == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active = busy, "Jobs still running at shutdown");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Waits until every queue is empty, including jobs waiting to be retried.
    pub async fn wait_drained(&self) {
        loop {
            let pending = self
                .queues
                .iter()
                .any(|q| q.active > 0 || q.delayed > 0 || !q.waiting.is_empty());
            if !pending {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Jobs on `queue` that failed on their last attempt since startup.
    pub fn failed(&self, queue: &str) -> u64 {
        self.queues.get(queue).map(|q| q.failed).unwrap_or(0)
    }

    fn dispatch_ready(self: &Arc<Self>) {
        let names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        for name in names {
            let Some(handler) = self.handlers.get(&name).map(|h| h.value().clone()) else {
                continue;
            };
            let limit = self.controller.parallelism(&name);
            loop {
                let job = {
                    let mut state = self.queues.entry(name.clone()).or_default();
                    if state.active >= limit {
                        None
                    } else {
                        let job = state.waiting.pop_front();
                        if job.is_some() {
                            state.active += 1;
                        }
                        job
                    }
                };
                let Some(job) = job else { break };
                self.clone().start(name.clone(), handler.clone(), job);
            }
        }
    }

    fn start(self: Arc<Self>, queue: String, handler: Handler, job: QueuedJob) {
        tokio::spawn(async move {
            tracing::debug!(queue = %queue, job_id = %job.id, attempt = job.attempt, "Job started");
            // Run in its own task so a panicking handler still releases its slot.
            let result = match tokio::spawn(handler(job.payload.clone())).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("job handler panicked: {}", e)),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(queue = %queue, job_id = %job.id, "Job completed");
                    self.finish(&queue);
                }
                Err(e) if job.attempt < job.options.attempts => {
                    let delay = job.options.backoff_for(job.attempt);
                    tracing::warn!(
                        queue = %queue,
                        job_id = %job.id,
                        attempt = job.attempt,
                        retry_in_secs = delay.as_secs_f64(),
                        error = %e,
                        "Job failed, retrying"
                    );
                    if let Some(mut state) = self.queues.get_mut(&queue) {
                        state.active -= 1;
                        state.delayed += 1;
                    }
                    tokio::time::sleep(delay).await;
                    if let Some(mut state) = self.queues.get_mut(&queue) {
                        state.delayed -= 1;
                        state.waiting.push_back(QueuedJob {
                            attempt: job.attempt + 1,
                            ..job
                        });
                    }
                    self.wake.notify_one();
                }
                Err(e) => {
                    tracing::error!(
                        queue = %queue,
                        job_id = %job.id,
                        attempts = job.attempt,
                        error = %e,
                        "Job failed permanently"
                    );
                    if let Some(mut state) = self.queues.get_mut(&queue) {
                        state.failed += 1;
                    }
                    self.finish(&queue);
                }
            }
        });
    }

    fn finish(&self, queue: &str) {
        if let Some(mut state) = self.queues.get_mut(queue) {
            state.active -= 1;
        }
        self.wake.notify_one();
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, queue: &str, payload: Value, options: JobOptions) -> dbsnap_core::Result<JobId> {
        let id = Uuid::new_v4().to_string();
        self.queues
            .entry(queue.to_string())
            .or_default()
            .waiting
            .push_back(QueuedJob {
                id: id.clone(),
                payload,
                options,
                attempt: 1,
            });
        tracing::debug!(queue = %queue, job_id = %id, "Job enqueued");
        self.wake.notify_one();
        Ok(id)
    }
}

#[async_trait]
impl QueueMetrics for LocalQueue {
    async fn counts(&self, queue: &str) -> dbsnap_core::Result<QueueCounts> {
        Ok(self
            .queues
            .get(queue)
            .map(|state| QueueCounts {
                waiting: state.waiting.len() as u64,
                active: state.active as u64,
            })
            .unwrap_or_default())
    }
}
