//! Router facade: selection, dispatch, outcome feedback, training and the
//! operator surface, over one shared policy engine.

use qroute_config::{RouterConfig, SelectionStrategy, TrainingConfig};
use qroute_core::{
    Experience, LOAD_SLOTS, PolicyStats, ReplicaId, RouterError, Selection, StateVector,
    Telemetry, TrainReport,
};
use qroute_policy::{PolicyEngine, RewardCalculator, StateCollector, heuristic_selection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::completion::{CompletionSynchronizer, JobResult};
use crate::dispatcher::{JobDispatcher, PendingJob};
use crate::load::LoadAccountant;
use crate::pipeline::JobPipeline;
use crate::telemetry::LiveTelemetry;

pub struct ReplicaRouter {
    strategy: SelectionStrategy,
    exploration: bool,
    training: TrainingConfig,
    engine: Arc<PolicyEngine>,
    accountant: Arc<LoadAccountant>,
    telemetry: Arc<LiveTelemetry>,
    dispatcher: JobDispatcher,
    synchronizer: Arc<CompletionSynchronizer>,
    rewards: RewardCalculator,
    collector: StateCollector,
    checkpoint_path: Option<PathBuf>,
}

impl std::fmt::Debug for ReplicaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRouter")
            .field("strategy", &self.strategy)
            .field("exploration", &self.exploration)
            .field("engine", &self.engine)
            .field("loads", &self.accountant.snapshot())
            .finish_non_exhaustive()
    }
}

impl ReplicaRouter {
    /// Build a router over `pipeline`. With a checkpoint path, a readable
    /// checkpoint there is restored and periodic checkpoints are written back
    /// to it; anything unreadable leaves fresh weights in place.
    pub fn new(
        config: &RouterConfig,
        pipeline: Arc<dyn JobPipeline>,
        checkpoint_path: Option<PathBuf>,
    ) -> Self {
        let engine = Arc::new(PolicyEngine::new(config, checkpoint_path.clone()));
        if let Some(path) = &checkpoint_path {
            engine.restore_or_fresh(path);
        }

        let accountant = Arc::new(LoadAccountant::new(engine.num_replicas()));
        let telemetry = Arc::new(LiveTelemetry::new(
            Arc::clone(&accountant),
            Arc::clone(&pipeline),
            &config.telemetry,
        ));
        let rewards = RewardCalculator::from_config(&config.reward);
        let dispatcher = JobDispatcher::new(
            Arc::clone(&pipeline),
            Arc::clone(&accountant),
            Arc::clone(&telemetry),
        );
        let synchronizer = Arc::new(CompletionSynchronizer::new(
            pipeline,
            Arc::clone(&telemetry),
            Arc::clone(&engine),
            rewards.clone(),
            config.dispatch.completion_deadline(),
        ));

        Self {
            strategy: config.router.strategy,
            exploration: config.router.exploration,
            training: config.training.clone(),
            engine,
            accountant,
            telemetry,
            dispatcher,
            synchronizer,
            rewards,
            collector: StateCollector,
            checkpoint_path,
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn num_replicas(&self) -> usize {
        self.accountant.num_replicas()
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn accountant(&self) -> &Arc<LoadAccountant> {
        &self.accountant
    }

    pub fn synchronizer(&self) -> &Arc<CompletionSynchronizer> {
        &self.synchronizer
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.training
    }

    pub fn loads(&self) -> Vec<u64> {
        self.accountant.snapshot()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.snapshot()
    }

    pub fn current_state(&self) -> StateVector {
        self.collector.collect(&self.telemetry.snapshot())
    }

    /// Select over live telemetry.
    pub fn select(&self) -> Selection {
        self.select_with(&self.telemetry.snapshot())
    }

    pub fn select_with(&self, telemetry: &Telemetry) -> Selection {
        let state = self.collector.collect(telemetry);
        self.choose(&state, &telemetry.replica_loads)
    }

    /// Select over a caller-supplied raw state (loads 0-100 in the first
    /// slots, everything else 0-1). Replicas past the load slots are judged
    /// by their live in-flight counts if the heuristic is used.
    pub fn select_state(&self, raw: &[f64]) -> Selection {
        let state = StateVector::from_raw(raw);
        let mut loads = self.accountant.snapshot();
        for (i, load) in loads.iter_mut().take(LOAD_SLOTS).enumerate() {
            let v = raw.get(i).copied().unwrap_or(0.0);
            *load = if v.is_finite() { v.max(0.0).round() as u64 } else { 0 };
        }
        self.choose(&state, &loads)
    }

    fn choose(&self, state: &StateVector, loads: &[u64]) -> Selection {
        let selection = match self.strategy {
            SelectionStrategy::HeuristicLeastConnections => heuristic_selection(loads),
            SelectionStrategy::LearnedPolicy if self.engine.is_cold() => {
                debug!("Policy has no training steps yet, using least connections");
                heuristic_selection(loads)
            }
            SelectionStrategy::LearnedPolicy => {
                match self.engine.select(state, self.exploration) {
                    Ok(selection) => selection,
                    Err(e) => {
                        warn!(error = %e, "Policy selection failed, using least connections");
                        heuristic_selection(loads)
                    }
                }
            }
        };
        debug!(
            replica = %selection.replica,
            source = ?selection.source,
            exploration = selection.exploration,
            confidence = selection.confidence,
            "Selected replica"
        );
        selection
    }

    /// Record an externally observed outcome. `resulting_loads` are the
    /// in-flight counts after the job finished.
    pub fn record_experience(
        &self,
        state: StateVector,
        action: ReplicaId,
        latency_ms: f64,
        success: bool,
        resulting_loads: &[u64],
    ) -> Result<(), RouterError> {
        let reward = self.rewards.reward(latency_ms, success, resulting_loads);
        let mut telemetry = self.telemetry.snapshot();
        telemetry.replica_loads = resulting_loads.to_vec();
        let experience = Experience {
            state,
            action,
            reward,
            next_state: self.collector.collect(&telemetry),
            terminal: false,
            timestamp: chrono::Utc::now(),
        };
        self.engine.remember(experience, latency_ms, success)
    }

    /// Run a training cycle on the blocking pool.
    pub async fn train(&self, batch_size: usize, iterations: u32) -> Result<TrainReport, RouterError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.train(batch_size, iterations))
            .await
            .map_err(|e| RouterError::PolicyFault(format!("training task failed: {e}")))?
    }

    pub fn stats(&self) -> PolicyStats {
        self.engine.stats()
    }

    pub fn reset_epsilon(&self, value: f64) -> Result<(), RouterError> {
        self.engine.reset_epsilon(value)
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<(), RouterError> {
        self.engine.save_checkpoint(path)
    }

    /// `save_checkpoint` on the blocking pool, for callers on the runtime.
    /// Retry backoff sleeps the calling thread.
    pub async fn persist_checkpoint(&self, path: PathBuf) -> Result<(), RouterError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.save_checkpoint(&path))
            .await
            .map_err(|e| RouterError::Checkpoint(format!("checkpoint task failed: {e}")))?
    }

    pub fn load_checkpoint(&self, path: &Path) -> Result<(), RouterError> {
        self.engine.load_checkpoint(path)
    }

    /// Dispatch `payload` to `replica` without waiting for the outcome.
    pub async fn dispatch(
        &self,
        replica: ReplicaId,
        state: StateVector,
        payload: serde_json::Value,
    ) -> Result<PendingJob, RouterError> {
        self.dispatcher.dispatch(replica, state, payload).await
    }

    /// Select a replica, dispatch, and wait for the outcome.
    pub async fn route(&self, payload: serde_json::Value) -> Result<JobResult, RouterError> {
        let telemetry = self.telemetry.snapshot();
        let state = self.collector.collect(&telemetry);
        let selection = self.choose(&state, &telemetry.replica_loads);
        let pending = self.dispatch(selection.replica, state, payload).await?;
        self.synchronizer.wait(pending).await
    }

    /// Dispatch to a fixed replica and wait for the outcome.
    pub async fn route_to(
        &self,
        replica: ReplicaId,
        payload: serde_json::Value,
    ) -> Result<JobResult, RouterError> {
        let state = self.current_state();
        let pending = self.dispatch(replica, state, payload).await?;
        self.synchronizer.wait(pending).await
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
