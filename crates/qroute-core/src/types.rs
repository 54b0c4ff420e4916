use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of fields in every state vector fed to the policy.
pub const STATE_DIM: usize = 10;

/// Leading state slots that carry per-replica in-flight loads.
pub const LOAD_SLOTS: usize = 3;

/// Raw load values are expected on a 0-100 scale.
const LOAD_SCALE: f64 = 100.0;

/// Zero-based replica index. Displays as the 1-based `replica-N` name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub usize);

impl ReplicaId {
    pub fn index(self) -> usize {
        self.0
    }

    /// Human-readable replica name, e.g. `replica-1` for index 0.
    pub fn name(self) -> String {
        format!("replica-{}", self.0 + 1)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica-{}", self.0 + 1)
    }
}

/// Unique job identifier (ULID string).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized ten-field policy input. Every field lies in `[0, 1]`.
///
/// Layout: slots 0-2 replica loads, 3 queue depth, 4 average latency,
/// 5 request rate, 6 success rate, 7 memory usage, 8 CPU usage, 9 time of day.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateVector([f32; STATE_DIM]);

impl StateVector {
    /// Build from values that are already on the unit scale; out-of-range
    /// and NaN entries are clamped.
    pub fn from_normalized(values: [f64; STATE_DIM]) -> Self {
        Self(values.map(unit))
    }

    /// Build from a caller-supplied raw state.
    ///
    /// Load slots are read on a 0-100 scale, every other slot on 0-1.
    /// Short inputs are zero-padded and long inputs truncated; nothing is
    /// rejected.
    pub fn from_raw(values: &[f64]) -> Self {
        let mut out = [0.0_f64; STATE_DIM];
        for (i, slot) in out.iter_mut().enumerate() {
            let v = values.get(i).copied().unwrap_or(0.0);
            *slot = if i < LOAD_SLOTS { v / LOAD_SCALE } else { v };
        }
        Self::from_normalized(out)
    }

    pub fn zeros() -> Self {
        Self([0.0; STATE_DIM])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn values(&self) -> [f32; STATE_DIM] {
        self.0
    }
}

fn unit(v: f64) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) as f32 }
}

/// Raw live signals from which a [`StateVector`] is assembled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// In-flight job count per replica, indexed by replica.
    pub replica_loads: Vec<u64>,
    pub queue_depth: u64,
    pub avg_latency_ms: f64,
    pub requests_per_sec: f64,
    /// Fraction of recent jobs that succeeded, 0-1.
    pub success_rate: f64,
    /// Host memory usage fraction, 0-1.
    pub memory_usage: f64,
    /// Host CPU usage fraction, 0-1.
    pub cpu_usage: f64,
    /// Local wall-clock hour, 0-23.
    pub hour_of_day: u32,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            replica_loads: Vec::new(),
            queue_depth: 0,
            avg_latency_ms: 0.0,
            requests_per_sec: 0.0,
            success_rate: 1.0,
            memory_usage: 0.0,
            cpu_usage: 0.0,
            hour_of_day: 0,
        }
    }
}

/// Where a replica choice came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionSource {
    Learned,
    Heuristic,
}

/// Outcome of a `Select` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub replica: ReplicaId,
    pub confidence: f64,
    pub exploration: bool,
    pub source: SelectionSource,
}

/// One recorded transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: StateVector,
    pub action: ReplicaId,
    pub reward: f64,
    pub next_state: StateVector,
    pub terminal: bool,
    pub timestamp: DateTime<Utc>,
}

/// Result written by a replica when it finishes a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_id: JobId,
    pub success: bool,
    pub worker: String,
    /// Time the worker spent on the job.
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Summary returned by a `Train` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    /// Mean loss over the steps that ran; `None` if every step was skipped.
    pub loss: Option<f64>,
    pub epsilon: f64,
    pub buffer_size: usize,
    pub steps_done: u64,
}

/// Snapshot returned by a `Stats` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub epsilon: f64,
    pub steps_done: u64,
    pub buffer_size: usize,
    pub average_recent_reward: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_name_is_one_based() {
        assert_eq!(ReplicaId(0).name(), "replica-1");
        assert_eq!(ReplicaId(2).to_string(), "replica-3");
        assert_eq!(ReplicaId(4).index(), 4);
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }

    #[test]
    fn test_from_raw_scales_loads_and_clamps_rest() {
        let state = StateVector::from_raw(&[5.0, 3.0, 7.0, 12.0, 0.28, 8.2, 0.98, 0.5, 0.4, 0.5]);
        let v = state.values();
        assert!((v[0] - 0.05).abs() < 1e-6);
        assert!((v[1] - 0.03).abs() < 1e-6);
        assert!((v[2] - 0.07).abs() < 1e-6);
        assert_eq!(v[3], 1.0);
        assert!((v[4] - 0.28).abs() < 1e-6);
        assert_eq!(v[5], 1.0);
        assert!((v[6] - 0.98).abs() < 1e-6);
    }

    #[test]
    fn test_from_raw_pads_and_truncates() {
        let short = StateVector::from_raw(&[50.0]);
        assert_eq!(short.values()[0], 0.5);
        assert!(short.values()[1..].iter().all(|v| *v == 0.0));

        let long = StateVector::from_raw(&[0.0; 14]);
        assert_eq!(long.as_slice().len(), STATE_DIM);
    }

    #[test]
    fn test_from_normalized_handles_non_finite() {
        let mut raw = [0.5; STATE_DIM];
        raw[0] = f64::NAN;
        raw[1] = f64::INFINITY;
        raw[2] = f64::NEG_INFINITY;
        raw[3] = -3.0;
        let v = StateVector::from_normalized(raw).values();
        assert_eq!(&v[..4], &[0.0, 1.0, 0.0, 0.0]);
        assert!(v.iter().all(|x| (0.0..=1.0).contains(x)));
    }

    #[test]
    fn test_state_vector_serde_roundtrip() {
        let state = StateVector::from_raw(&[10.0, 20.0, 30.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]);
        let json = serde_json::to_string(&state).unwrap();
        let back: StateVector = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_telemetry_default_assumes_healthy() {
        let t = Telemetry::default();
        assert_eq!(t.success_rate, 1.0);
        assert!(t.replica_loads.is_empty());
    }
}
