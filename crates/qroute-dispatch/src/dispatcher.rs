use qroute_core::{JobId, ReplicaId, RouterError, StateVector};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::load::{LoadAccountant, LoadLease};
use crate::pipeline::JobPipeline;
use crate::telemetry::LiveTelemetry;

/// A dispatched job awaiting its terminal outcome. Owns the replica's
/// in-flight load until the outcome is resolved.
#[derive(Debug)]
pub struct PendingJob {
    pub job_id: JobId,
    pub replica: ReplicaId,
    /// State the routing decision was made on.
    pub state: StateVector,
    pub enqueued_at: Instant,
    pub(crate) lease: LoadLease,
}

pub struct JobDispatcher {
    pipeline: Arc<dyn JobPipeline>,
    accountant: Arc<LoadAccountant>,
    telemetry: Arc<LiveTelemetry>,
}

impl JobDispatcher {
    pub fn new(
        pipeline: Arc<dyn JobPipeline>,
        accountant: Arc<LoadAccountant>,
        telemetry: Arc<LiveTelemetry>,
    ) -> Self {
        Self {
            pipeline,
            accountant,
            telemetry,
        }
    }

    /// Count the job against `replica` and enqueue it.
    ///
    /// The load is taken before the enqueue so a fast worker can never
    /// complete a job that is not yet counted. If the enqueue fails the load
    /// is given back and no experience is recorded.
    pub async fn dispatch(
        &self,
        replica: ReplicaId,
        state: StateVector,
        payload: serde_json::Value,
    ) -> Result<PendingJob, RouterError> {
        let mut lease = self.accountant.acquire(replica)?;
        let enqueued_at = Instant::now();

        match self.pipeline.enqueue(replica, payload).await {
            Ok(job_id) => {
                self.telemetry.window().record_dispatch();
                debug!(%job_id, %replica, "Dispatched job");
                Ok(PendingJob {
                    job_id,
                    replica,
                    state,
                    enqueued_at,
                    lease,
                })
            }
            Err(e) => {
                lease.release();
                warn!(%replica, error = %e, "Enqueue failed, load rolled back");
                Err(RouterError::EnqueueFailed {
                    replica,
                    reason: e.to_string(),
                })
            }
        }
    }
}
