use std::time::Duration;

use crate::types::{JobId, ReplicaId};

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("Replay buffer holds {available} experiences, need {requested} to train")]
    InsufficientData { available: usize, requested: usize },

    #[error("Policy fault: {0}")]
    PolicyFault(String),

    #[error("Job {job_id} timed out after {deadline:?}")]
    JobTimeout { job_id: JobId, deadline: Duration },

    #[error("Failed to enqueue job for {replica}: {reason}")]
    EnqueueFailed { replica: ReplicaId, reason: String },

    #[error("Replica index {replica} out of range (num_replicas: {num_replicas})")]
    InvalidReplica { replica: usize, num_replicas: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl RouterError {
    /// Whether the training loop may simply skip this cycle.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_insufficient_data() {
        let err = RouterError::InsufficientData {
            available: 12,
            requested: 64,
        };
        assert_eq!(
            err.to_string(),
            "Replay buffer holds 12 experiences, need 64 to train"
        );
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_display_policy_fault() {
        let err = RouterError::PolicyFault("non-finite q-value".into());
        assert_eq!(err.to_string(), "Policy fault: non-finite q-value");
        assert!(!err.is_insufficient_data());
    }

    #[test]
    fn test_display_job_timeout() {
        let err = RouterError::JobTimeout {
            job_id: JobId::from("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()),
            deadline: Duration::from_secs(60),
        };
        assert_eq!(
            err.to_string(),
            "Job 01ARZ3NDEKTSV4RRFFQ69G5FAV timed out after 60s"
        );
    }

    #[test]
    fn test_display_enqueue_failed() {
        let err = RouterError::EnqueueFailed {
            replica: ReplicaId(1),
            reason: "ingress queue closed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to enqueue job for replica-2: ingress queue closed"
        );
    }

    #[test]
    fn test_display_invalid_replica() {
        let err = RouterError::InvalidReplica {
            replica: 7,
            num_replicas: 3,
        };
        assert_eq!(
            err.to_string(),
            "Replica index 7 out of range (num_replicas: 3)"
        );
    }

    #[test]
    fn test_display_checkpoint_and_pipeline() {
        assert_eq!(
            RouterError::Checkpoint("disk full".into()).to_string(),
            "Checkpoint error: disk full"
        );
        assert_eq!(
            RouterError::Pipeline("store poisoned".into()).to_string(),
            "Pipeline error: store poisoned"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RouterError>();
    }
}
