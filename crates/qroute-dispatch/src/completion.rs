//! Per-job wait for a terminal outcome.
//!
//! Each pending job resolves exactly once, to COMPLETED (a record arrived in
//! time) or TIMED_OUT (the deadline passed). Either way the in-flight load is
//! released once and one experience is stored. The wait runs on its own task
//! so a caller that stops listening cannot skip that cleanup.

use chrono::Utc;
use qroute_core::{CompletionRecord, Experience, JobId, ReplicaId, RouterError};
use qroute_policy::{PolicyEngine, RewardCalculator, StateCollector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::dispatcher::PendingJob;
use crate::pipeline::JobPipeline;
use crate::telemetry::LiveTelemetry;

/// A job that reached COMPLETED. `record.success` may still be false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub replica: ReplicaId,
    pub record: CompletionRecord,
    /// Dispatch-to-completion time seen by the router.
    pub latency_ms: f64,
    pub reward: f64,
}

pub struct CompletionSynchronizer {
    pipeline: Arc<dyn JobPipeline>,
    telemetry: Arc<LiveTelemetry>,
    engine: Arc<PolicyEngine>,
    rewards: RewardCalculator,
    collector: StateCollector,
    deadline: Duration,
    resolved: AtomicU64,
    job_done: Notify,
}

impl CompletionSynchronizer {
    pub fn new(
        pipeline: Arc<dyn JobPipeline>,
        telemetry: Arc<LiveTelemetry>,
        engine: Arc<PolicyEngine>,
        rewards: RewardCalculator,
        deadline: Duration,
    ) -> Self {
        Self {
            pipeline,
            telemetry,
            engine,
            rewards,
            collector: StateCollector,
            deadline,
            resolved: AtomicU64::new(0),
            job_done: Notify::new(),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Jobs resolved so far, completed or timed out.
    pub fn resolved_jobs(&self) -> u64 {
        self.resolved.load(Ordering::Acquire)
    }

    /// Resolves after at least one job has finished since the last call.
    pub async fn job_resolved(&self) {
        self.job_done.notified().await;
    }

    /// Wait for `job` on a dedicated task and return its outcome.
    pub async fn wait(self: &Arc<Self>, job: PendingJob) -> Result<JobResult, RouterError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.resolve(job).await })
            .await
            .map_err(|e| RouterError::Pipeline(format!("completion task failed: {e}")))?
    }

    async fn resolve(&self, mut job: PendingJob) -> Result<JobResult, RouterError> {
        let outcome = self
            .pipeline
            .await_completion(&job.job_id, self.deadline)
            .await;
        let latency_ms = job.enqueued_at.elapsed().as_secs_f64() * 1000.0;

        // The only decrement for this job.
        job.lease.release();

        let success = matches!(&outcome, Ok(Some(record)) if record.success);
        let terminal = !matches!(&outcome, Ok(Some(_)));
        let resulting = self.telemetry.snapshot();
        let reward = self
            .rewards
            .reward(latency_ms, success, &resulting.replica_loads);
        self.telemetry.window().record_outcome(latency_ms, success);

        let experience = Experience {
            state: job.state,
            action: job.replica,
            reward,
            next_state: self.collector.collect(&resulting),
            terminal,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.engine.remember(experience, latency_ms, success) {
            warn!(job_id = %job.job_id, error = %e, "Dropping experience");
        }
        self.resolved.fetch_add(1, Ordering::AcqRel);
        self.job_done.notify_one();

        match outcome {
            Ok(Some(record)) => {
                info!(
                    job_id = %job.job_id,
                    replica = %job.replica,
                    success = record.success,
                    latency_ms,
                    reward,
                    "Job completed"
                );
                Ok(JobResult {
                    job_id: job.job_id,
                    replica: job.replica,
                    record,
                    latency_ms,
                    reward,
                })
            }
            Ok(None) => {
                warn!(
                    job_id = %job.job_id,
                    replica = %job.replica,
                    deadline = ?self.deadline,
                    "Job timed out"
                );
                Err(RouterError::JobTimeout {
                    job_id: job.job_id,
                    deadline: self.deadline,
                })
            }
            Err(e) => {
                warn!(job_id = %job.job_id, replica = %job.replica, error = %e, "Completion wait failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MemoryPipeline;
    use crate::router::ReplicaRouter;
    use qroute_config::{RouterConfig, SelectionStrategy};

    fn router() -> (Arc<ReplicaRouter>, Arc<MemoryPipeline>) {
        let mut config = RouterConfig::default();
        config.router.strategy = SelectionStrategy::HeuristicLeastConnections;
        config.policy.seed = Some(4);
        config.policy.hidden_size = 8;
        let pipeline = Arc::new(MemoryPipeline::new(3, config.dispatch.completion_ttl()));
        let router = Arc::new(ReplicaRouter::new(&config, pipeline.clone(), None));
        (router, pipeline)
    }

    fn late_record(job_id: JobId) -> CompletionRecord {
        CompletionRecord {
            job_id,
            success: true,
            worker: "replica-2".into(),
            latency_ms: 61_000.0,
            response: Some("late".into()),
            error: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_after_deadline_does_not_resolve_twice() {
        let (router, pipeline) = router();
        let mut inbox = pipeline.take_inbox(ReplicaId(1)).unwrap();
        let before = router.loads();

        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.route_to(ReplicaId(1), serde_json::Value::Null).await })
        };
        let job = inbox.recv().await.unwrap();
        assert_eq!(router.loads()[1], before[1] + 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::JobTimeout { .. }), "{err:?}");

        // The worker answers after the job already timed out.
        pipeline.post_completion(late_record(job.job_id)).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(router.loads(), before);
        assert_eq!(router.stats().buffer_size, 1);
        assert_eq!(router.synchronizer().resolved_jobs(), 1);

        let stored = router.engine().replay().snapshot();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].terminal);
        assert_eq!(stored[0].reward, -10.0);
        assert_eq!(stored[0].action, ReplicaId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_in_time_is_not_terminal() {
        let (router, pipeline) = router();
        let mut inbox = pipeline.take_inbox(ReplicaId(0)).unwrap();

        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.route_to(ReplicaId(0), serde_json::Value::Null).await })
        };
        let job = inbox.recv().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        pipeline.post_completion(late_record(job.job_id)).unwrap();

        let result = task.await.unwrap().unwrap();
        assert!(result.record.success);
        assert_eq!(router.loads(), vec![0, 0, 0]);
        assert_eq!(router.synchronizer().resolved_jobs(), 1);
        let stored = router.engine().replay().snapshot();
        assert!(!stored[0].terminal);
        assert!(stored[0].reward > -10.0);
    }
}
