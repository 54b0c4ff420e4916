//! Telemetry to policy-input encoding.

use qroute_core::{LOAD_SLOTS, STATE_DIM, StateVector, Telemetry};

const LOAD_SCALE: f64 = 100.0;
const QUEUE_SCALE: f64 = 100.0;
const LATENCY_SCALE_MS: f64 = 1000.0;
const RPS_SCALE: f64 = 10.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Builds the fixed-width state vector from live telemetry.
///
/// Loads for replicas beyond the third are not represented; fewer than three
/// replicas leave the remaining load slots at zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateCollector;

impl StateCollector {
    pub fn collect(&self, telemetry: &Telemetry) -> StateVector {
        let mut raw = [0.0_f64; STATE_DIM];
        for (slot, load) in raw
            .iter_mut()
            .take(LOAD_SLOTS)
            .zip(&telemetry.replica_loads)
        {
            *slot = *load as f64 / LOAD_SCALE;
        }
        raw[3] = telemetry.queue_depth as f64 / QUEUE_SCALE;
        raw[4] = telemetry.avg_latency_ms / LATENCY_SCALE_MS;
        raw[5] = telemetry.requests_per_sec / RPS_SCALE;
        raw[6] = telemetry.success_rate;
        raw[7] = telemetry.memory_usage;
        raw[8] = telemetry.cpu_usage;
        raw[9] = f64::from(telemetry.hour_of_day) / HOURS_PER_DAY;
        StateVector::from_normalized(raw)
    }
}
