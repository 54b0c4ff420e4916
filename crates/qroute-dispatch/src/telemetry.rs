//! Live signals for the policy state: a rolling window of job outcomes plus
//! host memory and CPU usage.

use chrono::Timelike;
use parking_lot::Mutex;
use qroute_config::TelemetryConfig;
use qroute_core::Telemetry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;

use crate::load::LoadAccountant;
use crate::pipeline::JobPipeline;

#[derive(Debug, Default)]
struct WindowState {
    latencies_ms: VecDeque<f64>,
    outcomes: VecDeque<(Instant, bool)>,
    dispatches: VecDeque<Instant>,
}

/// Recent latencies (count-bounded) and outcome/dispatch timestamps
/// (time-bounded).
#[derive(Debug)]
pub struct TelemetryWindow {
    state: Mutex<WindowState>,
    window: Duration,
    latency_window: usize,
}

impl TelemetryWindow {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
            window: config.window().max(Duration::from_secs(1)),
            latency_window: config.latency_window.max(1),
        }
    }

    pub fn record_dispatch(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.dispatches.push_back(now);
        prune(&mut state, now, self.window);
    }

    pub fn record_outcome(&self, latency_ms: f64, success: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if latency_ms.is_finite() {
            if state.latencies_ms.len() == self.latency_window {
                state.latencies_ms.pop_front();
            }
            state.latencies_ms.push_back(latency_ms.max(0.0));
        }
        state.outcomes.push_back((now, success));
        prune(&mut state, now, self.window);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let state = self.state.lock();
        if state.latencies_ms.is_empty() {
            return 0.0;
        }
        state.latencies_ms.iter().sum::<f64>() / state.latencies_ms.len() as f64
    }

    /// Share of outcomes in the window that succeeded; 1.0 with no outcomes.
    pub fn success_rate(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        prune(&mut state, now, self.window);
        if state.outcomes.is_empty() {
            return 1.0;
        }
        let ok = state.outcomes.iter().filter(|(_, s)| *s).count();
        ok as f64 / state.outcomes.len() as f64
    }

    /// Dispatches per second over the window.
    pub fn requests_per_sec(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        prune(&mut state, now, self.window);
        state.dispatches.len() as f64 / self.window.as_secs_f64()
    }
}

fn prune(state: &mut WindowState, now: Instant, window: Duration) {
    while let Some(t) = state.dispatches.front() {
        if now.duration_since(*t) <= window {
            break;
        }
        state.dispatches.pop_front();
    }
    while let Some((t, _)) = state.outcomes.front() {
        if now.duration_since(*t) <= window {
            break;
        }
        state.outcomes.pop_front();
    }
}

/// Host memory/CPU sampler. Refreshes at most once per `min_interval`.
pub struct SystemProbe {
    sys: System,
    last_refresh: Option<Instant>,
    min_interval: Duration,
    memory_usage: f64,
    cpu_usage: f64,
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe")
            .field("memory_usage", &self.memory_usage)
            .field("cpu_usage", &self.cpu_usage)
            .finish()
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)
    }
}

impl SystemProbe {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            sys: System::new(),
            last_refresh: None,
            min_interval,
            memory_usage: 0.0,
            cpu_usage: 0.0,
        }
    }

    /// `(memory_usage, cpu_usage)` as fractions in `[0, 1]`.
    pub fn sample(&mut self) -> (f64, f64) {
        let now = Instant::now();
        let stale = self
            .last_refresh
            .is_none_or(|t| now.duration_since(t) >= self.min_interval);
        if stale {
            self.sys.refresh_memory();
            self.sys.refresh_cpu_usage();
            let total = self.sys.total_memory();
            self.memory_usage = if total == 0 {
                0.0
            } else {
                self.sys.used_memory() as f64 / total as f64
            };
            self.cpu_usage = f64::from(self.sys.global_cpu_usage()) / 100.0;
            self.last_refresh = Some(now);
        }
        (
            self.memory_usage.clamp(0.0, 1.0),
            self.cpu_usage.clamp(0.0, 1.0),
        )
    }
}

/// Assembles a [`Telemetry`] snapshot from the router's live components.
pub struct LiveTelemetry {
    accountant: Arc<LoadAccountant>,
    pipeline: Arc<dyn JobPipeline>,
    window: TelemetryWindow,
    probe: Mutex<SystemProbe>,
}

impl std::fmt::Debug for LiveTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTelemetry")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl LiveTelemetry {
    pub fn new(
        accountant: Arc<LoadAccountant>,
        pipeline: Arc<dyn JobPipeline>,
        config: &TelemetryConfig,
    ) -> Self {
        Self {
            accountant,
            pipeline,
            window: TelemetryWindow::new(config),
            probe: Mutex::new(SystemProbe::default()),
        }
    }

    pub fn window(&self) -> &TelemetryWindow {
        &self.window
    }

    pub fn snapshot(&self) -> Telemetry {
        let (memory_usage, cpu_usage) = self.probe.lock().sample();
        Telemetry {
            replica_loads: self.accountant.snapshot(),
            queue_depth: self.pipeline.queue_depth(),
            avg_latency_ms: self.window.avg_latency_ms(),
            requests_per_sec: self.window.requests_per_sec(),
            success_rate: self.window.success_rate(),
            memory_usage,
            cpu_usage,
            hour_of_day: chrono::Local::now().hour(),
        }
    }
}
