//! Job hand-off to replicas and keyed completion records.
//!
//! [`JobPipeline`] is the seam to whatever transport actually carries jobs.
//! [`MemoryPipeline`] keeps one ingress queue per replica and an expiring
//! completion store in process, which is enough for the simulator and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qroute_core::{CompletionRecord, JobId, ReplicaId, RouterError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

/// A job as seen by a replica's worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub replica: ReplicaId,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobPipeline: Send + Sync {
    /// Hand `payload` to `replica`'s ingress queue. Returns immediately.
    async fn enqueue(
        &self,
        replica: ReplicaId,
        payload: serde_json::Value,
    ) -> Result<JobId, RouterError>;

    /// Wait up to `deadline` for the record keyed by `job_id`, consuming it.
    /// `Ok(None)` means the deadline elapsed first.
    async fn await_completion(
        &self,
        job_id: &JobId,
        deadline: Duration,
    ) -> Result<Option<CompletionRecord>, RouterError>;

    /// Jobs enqueued but not yet picked up by any worker.
    fn queue_depth(&self) -> u64;
}

#[derive(Debug)]
struct StoredCompletion {
    record: CompletionRecord,
    expires_at: Instant,
}

pub struct MemoryPipeline {
    senders: Vec<mpsc::UnboundedSender<QueuedJob>>,
    receivers: Mutex<Vec<Option<mpsc::UnboundedReceiver<QueuedJob>>>>,
    depth: Arc<AtomicU64>,
    completions: Mutex<HashMap<JobId, StoredCompletion>>,
    posted: Notify,
    ttl: Duration,
}

impl std::fmt::Debug for MemoryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPipeline")
            .field("replicas", &self.senders.len())
            .field("queue_depth", &self.queue_depth())
            .field("stored_completions", &self.completions.lock().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl MemoryPipeline {
    /// `ttl` bounds how long an unconsumed completion record stays readable.
    pub fn new(num_replicas: usize, ttl: Duration) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_replicas)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        Self {
            senders,
            receivers: Mutex::new(receivers),
            depth: Arc::new(AtomicU64::new(0)),
            completions: Mutex::new(HashMap::new()),
            posted: Notify::new(),
            ttl,
        }
    }

    /// Take the worker end of `replica`'s ingress queue. Each inbox can be
    /// taken once.
    pub fn take_inbox(&self, replica: ReplicaId) -> Option<ReplicaInbox> {
        let rx = self.receivers.lock().get_mut(replica.index())?.take()?;
        Some(ReplicaInbox {
            replica,
            rx,
            depth: Arc::clone(&self.depth),
        })
    }

    /// Store a worker's result. A second record for the same job is rejected.
    pub fn post_completion(&self, record: CompletionRecord) -> Result<(), RouterError> {
        let now = Instant::now();
        {
            let mut completions = self.completions.lock();
            completions.retain(|_, stored| stored.expires_at > now);
            if completions.contains_key(&record.job_id) {
                return Err(RouterError::Pipeline(format!(
                    "duplicate completion for job {}",
                    record.job_id
                )));
            }
            debug!(job_id = %record.job_id, success = record.success, "Completion posted");
            completions.insert(
                record.job_id.clone(),
                StoredCompletion {
                    record,
                    expires_at: now + self.ttl,
                },
            );
        }
        self.posted.notify_waiters();
        Ok(())
    }

    /// Records still readable.
    pub fn pending_completions(&self) -> usize {
        let now = Instant::now();
        self.completions
            .lock()
            .values()
            .filter(|stored| stored.expires_at > now)
            .count()
    }

    fn take_completion(&self, job_id: &JobId) -> Option<CompletionRecord> {
        let stored = self.completions.lock().remove(job_id)?;
        if stored.expires_at <= Instant::now() {
            debug!(%job_id, "Completion record expired before it was read");
            return None;
        }
        Some(stored.record)
    }
}

#[async_trait]
impl JobPipeline for MemoryPipeline {
    async fn enqueue(
        &self,
        replica: ReplicaId,
        payload: serde_json::Value,
    ) -> Result<JobId, RouterError> {
        let sender = self
            .senders
            .get(replica.index())
            .ok_or(RouterError::InvalidReplica {
                replica: replica.index(),
                num_replicas: self.senders.len(),
            })?;
        let job = QueuedJob {
            job_id: JobId::generate(),
            replica,
            payload,
            enqueued_at: Utc::now(),
        };
        let job_id = job.job_id.clone();
        self.depth.fetch_add(1, Ordering::AcqRel);
        if sender.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(RouterError::Pipeline(format!(
                "ingress queue for {replica} is closed"
            )));
        }
        Ok(job_id)
    }

    async fn await_completion(
        &self,
        job_id: &JobId,
        deadline: Duration,
    ) -> Result<Option<CompletionRecord>, RouterError> {
        let deadline_at = Instant::now() + deadline;
        loop {
            // Register interest before checking so a post between the check
            // and the wait is not missed.
            let notified = self.posted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.take_completion(job_id) {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline_at, notified).await.is_err() {
                return Ok(self.take_completion(job_id));
            }
        }
    }

    fn queue_depth(&self) -> u64 {
        self.depth.load(Ordering::Acquire)
    }
}

/// Worker end of one replica's ingress queue.
#[derive(Debug)]
pub struct ReplicaInbox {
    replica: ReplicaId,
    rx: mpsc::UnboundedReceiver<QueuedJob>,
    depth: Arc<AtomicU64>,
}

impl ReplicaInbox {
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Next job, or `None` once the pipeline is dropped.
    pub async fn recv(&mut self) -> Option<QueuedJob> {
        let job = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(job_id: &JobId, success: bool) -> CompletionRecord {
        CompletionRecord {
            job_id: job_id.clone(),
            success,
            worker: "replica-1".into(),
            latency_ms: 12.5,
            response: Some("ok".into()),
            error: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_reaches_inbox_and_tracks_depth() {
        let pipeline = MemoryPipeline::new(2, Duration::from_secs(60));
        let mut inbox = pipeline.take_inbox(ReplicaId(1)).unwrap();
        assert!(pipeline.take_inbox(ReplicaId(1)).is_none());

        let job_id = pipeline
            .enqueue(ReplicaId(1), serde_json::json!({"prompt": "hi"}))
            .await
            .unwrap();
        assert_eq!(pipeline.queue_depth(), 1);

        let job = inbox.recv().await.unwrap();
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.replica, ReplicaId(1));
        assert_eq!(job.payload["prompt"], "hi");
        assert_eq!(pipeline.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_replica() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(60));
        let err = pipeline
            .enqueue(ReplicaId(4), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidReplica { replica: 4, .. }));
        assert_eq!(pipeline.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_to_closed_inbox_fails() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(60));
        drop(pipeline.take_inbox(ReplicaId(0)));
        let err = pipeline
            .enqueue(ReplicaId(0), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Pipeline(_)));
        assert_eq!(pipeline.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_completion_already_posted_is_returned() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(60));
        let job_id = JobId::generate();
        pipeline.post_completion(record(&job_id, true)).unwrap();

        let got = pipeline
            .await_completion(&job_id, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(got.success);
        assert_eq!(pipeline.pending_completions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_woken_by_post() {
        let pipeline = Arc::new(MemoryPipeline::new(1, Duration::from_secs(60)));
        let job_id = JobId::generate();

        let waiter = {
            let pipeline = Arc::clone(&pipeline);
            let job_id = job_id.clone();
            tokio::spawn(async move {
                pipeline
                    .await_completion(&job_id, Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        pipeline.post_completion(record(&job_id, false)).unwrap();

        let got = waiter.await.unwrap().unwrap().unwrap();
        assert!(!got.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses_without_record() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(60));
        let start = Instant::now();
        let got = pipeline
            .await_completion(&JobId::generate(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_is_consumed_once() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(60));
        let job_id = JobId::generate();
        pipeline.post_completion(record(&job_id, true)).unwrap();

        assert!(
            pipeline
                .await_completion(&job_id, Duration::from_secs(1))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            pipeline
                .await_completion(&job_id, Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_record_expires_after_ttl() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(10));
        let job_id = JobId::generate();
        pipeline.post_completion(record(&job_id, true)).unwrap();
        assert_eq!(pipeline.pending_completions(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pipeline.pending_completions(), 0);
        let got = pipeline
            .await_completion(&job_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_completion_rejected() {
        let pipeline = MemoryPipeline::new(1, Duration::from_secs(60));
        let job_id = JobId::generate();
        pipeline.post_completion(record(&job_id, true)).unwrap();
        let err = pipeline.post_completion(record(&job_id, false)).unwrap_err();
        assert!(err.to_string().contains("duplicate completion"));
    }
}
