//! Adaptive per-queue concurrency.
//!
//! Parallelism grows fast under backlog and shrinks slowly once a queue is
//! idle, so bursty arrivals do not make it oscillate. The controller only
//! changes how many jobs the dispatch layer lets run at once; it never starts
//! or stops workers itself.

use crate::jobs::{QueueCounts, QueueMetrics};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub min: usize,
    pub max: usize,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    /// Waiting jobs above which a queue scales up.
    pub backlog_threshold: u64,
    pub interval: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min: 5,
            max: 20,
            scale_up_step: 5,
            scale_down_step: 2,
            backlog_threshold: 10,
            interval: Duration::from_secs(30),
        }
    }
}

impl ScalingPolicy {
    /// Parallelism after one evaluation at `current`.
    pub fn next(&self, current: usize, counts: QueueCounts) -> usize {
        if counts.waiting > self.backlog_threshold && current < self.max {
            (current + self.scale_up_step).min(self.max)
        } else if counts.waiting + counts.active == 0 && current > self.min {
            current.saturating_sub(self.scale_down_step).max(self.min)
        } else {
            current
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScalingChange {
    pub queue: String,
    pub from: usize,
    pub to: usize,
}

pub struct ConcurrencyController {
    policy: ScalingPolicy,
    parallelism: DashMap<String, usize>,
}

impl ConcurrencyController {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            parallelism: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Starts tracking `queue` at the baseline parallelism.
    pub fn manage(&self, queue: &str) {
        self.parallelism.entry(queue.to_string()).or_insert(self.policy.min);
    }

    /// Current parallelism for `queue`; unmanaged queues get the baseline.
    pub fn parallelism(&self, queue: &str) -> usize {
        self.parallelism
            .get(queue)
            .map(|p| *p)
            .unwrap_or(self.policy.min)
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.parallelism.iter().map(|e| e.key().clone()).collect();
        queues.sort();
        queues
    }

    #[cfg(test)]
    fn set(&self, queue: &str, value: usize) {
        self.parallelism.insert(queue.to_string(), value);
    }

    /// Evaluates every managed queue once and returns the changes made.
    ///
    /// A queue whose depth cannot be read keeps its parallelism.
    pub async fn tick(&self, metrics: &dyn QueueMetrics) -> Vec<ScalingChange> {
        let mut changes = Vec::new();
        for queue in self.queues() {
            let counts = match metrics.counts(&queue).await {
                Ok(counts) => counts,
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Failed to read queue depth");
                    continue;
                }
            };

            let current = self.parallelism(&queue);
            let next = self.policy.next(current, counts);
            if next != current {
                self.parallelism.insert(queue.clone(), next);
                tracing::info!(
                    queue = %queue,
                    from = current,
                    to = next,
                    waiting = counts.waiting,
                    active = counts.active,
                    "Adjusted queue parallelism"
                );
                changes.push(ScalingChange {
                    queue,
                    from: current,
                    to: next,
                });
            }
        }
        changes
    }

    /// Runs [`tick`](Self::tick) every policy interval until cancelled.
    pub fn spawn(self: Arc<Self>, metrics: Arc<dyn QueueMetrics>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.policy.interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick(metrics.as_ref()).await;
                    }
                }
            }
            tracing::info!("Concurrency controller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::{Result, SnapError};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedMetrics(HashMap<String, QueueCounts>);

    #[async_trait]
    impl QueueMetrics for FixedMetrics {
        async fn counts(&self, queue: &str) -> Result<QueueCounts> {
            self.0
                .get(queue)
                .copied()
                .ok_or_else(|| SnapError::Storage(format!("no such queue: {}", queue)))
        }
    }

    fn counts(waiting: u64, active: u64) -> QueueCounts {
        QueueCounts { waiting, active }
    }

    #[test]
    fn test_policy_transitions() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.next(9, counts(0, 0)), 7);
        assert_eq!(policy.next(6, counts(0, 0)), 5);
        assert_eq!(policy.next(5, counts(0, 0)), 5);
        assert_eq!(policy.next(10, counts(15, 0)), 15);
        assert_eq!(policy.next(18, counts(15, 3)), 20);
        assert_eq!(policy.next(20, counts(100, 20)), 20);
        // Busy but not backlogged: hold.
        assert_eq!(policy.next(12, counts(10, 4)), 12);
        assert_eq!(policy.next(12, counts(0, 1)), 12);
    }

    #[tokio::test]
    async fn test_tick_adjusts_each_queue() {
        let controller = ConcurrencyController::new(ScalingPolicy::default());
        for queue in ["snapshots", "diffs", "restores"] {
            controller.manage(queue);
        }
        controller.set("snapshots", 9);
        controller.set("diffs", 10);
        controller.set("restores", 18);

        let metrics = FixedMetrics(HashMap::from([
            ("snapshots".to_string(), counts(0, 0)),
            ("diffs".to_string(), counts(15, 2)),
            ("restores".to_string(), counts(15, 0)),
        ]));

        let changes = controller.tick(&metrics).await;
        assert_eq!(changes.len(), 3);
        assert_eq!(controller.parallelism("snapshots"), 7);
        assert_eq!(controller.parallelism("diffs"), 15);
        assert_eq!(controller.parallelism("restores"), 20);
    }

    #[tokio::test]
    async fn test_unreadable_queue_is_left_alone() {
        let controller = ConcurrencyController::new(ScalingPolicy::default());
        controller.manage("orphans");
        controller.set("orphans", 12);

        let changes = controller.tick(&FixedMetrics(HashMap::new())).await;
        assert!(changes.is_empty());
        assert_eq!(controller.parallelism("orphans"), 12);
    }

    #[test]
    fn test_manage_starts_at_baseline() {
        let controller = ConcurrencyController::new(ScalingPolicy::default());
        controller.manage("snapshots");
        assert_eq!(controller.parallelism("snapshots"), 5);
        assert_eq!(controller.parallelism("unknown"), 5);
        assert_eq!(controller.queues(), vec!["snapshots"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_controller_ticks_on_interval() {
        let controller = Arc::new(ConcurrencyController::new(ScalingPolicy::default()));
        controller.manage("snapshots");
        let metrics: Arc<dyn QueueMetrics> =
            Arc::new(FixedMetrics(HashMap::from([("snapshots".to_string(), counts(50, 0))])));
        let cancel = CancellationToken::new();
        let handle = controller.clone().spawn(metrics, cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(controller.parallelism("snapshots"), 10);

        cancel.cancel();
        handle.await.unwrap();
    }
}
