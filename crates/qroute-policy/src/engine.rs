//! Epsilon-greedy Deep-Q policy.
//!
//! Request-path reads go through an [`ArcSwap`] holding an immutable
//! [`PolicySnapshot`]; training mutates a private [`Learner`] behind a mutex
//! and publishes a fresh snapshot only after each completed update.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use qroute_config::RouterConfig;
use qroute_core::{
    Experience, PolicyStats, ReplicaId, RouterError, STATE_DIM, Selection, SelectionSource,
    StateVector, TrainReport,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, save_with_retry};
use crate::history::{ExperienceLog, LoggedExperience};
use crate::network::QNetwork;
use crate::optimizer::Adam;
use crate::replay::ReplayMemory;

/// Weights and counters visible to selection. Never mutated once published.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub network: QNetwork,
    pub epsilon: f64,
    pub steps_done: u64,
}

#[derive(Debug, Clone)]
struct EngineSettings {
    num_replicas: usize,
    hidden_size: usize,
    gamma: f32,
    epsilon_min: f64,
    epsilon_decay: f64,
    max_grad_norm: f32,
    target_sync_interval: u64,
    checkpoint_interval: u64,
    checkpoint_attempts: u32,
    checkpoint_backoff: Duration,
    checkpoint_path: Option<PathBuf>,
}

impl EngineSettings {
    fn expected_shape(&self) -> Vec<usize> {
        vec![
            STATE_DIM,
            self.hidden_size,
            self.hidden_size,
            self.hidden_size,
            self.num_replicas,
        ]
    }
}

/// Training-side state. Only touched with the engine's learner lock held.
#[derive(Debug)]
struct Learner {
    online: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    epsilon: f64,
    steps_done: u64,
    rng: ChaCha8Rng,
}

impl Learner {
    /// One MSE gradient step over `batch`. Returns the loss measured before
    /// the update.
    fn fit_batch(
        &mut self,
        batch: &[Experience],
        gamma: f32,
        max_grad_norm: f32,
    ) -> Result<f64, RouterError> {
        let actions = self.online.output_dim();
        let scale = 2.0 / batch.len() as f32;
        let mut grads = self.online.zeros_like();
        let mut loss = 0.0_f64;

        for exp in batch {
            let action = exp.action.index();
            if action >= actions {
                return Err(RouterError::InvalidReplica {
                    replica: action,
                    num_replicas: actions,
                });
            }
            let target_q = if exp.terminal {
                exp.reward as f32
            } else {
                let next = self.target.forward(exp.next_state.as_slice());
                let best = next.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                exp.reward as f32 + gamma * best
            };

            let (trace, q) = self.online.forward_trace(exp.state.as_slice());
            let err = q[action] - target_q;
            loss += f64::from(err * err);
            self.online
                .accumulate_action_grad(&trace, action, scale * err, &mut grads);
        }

        let loss = loss / batch.len() as f64;
        if !loss.is_finite() || !grads.is_finite() {
            return Err(RouterError::PolicyFault(format!(
                "training produced non-finite loss ({loss})"
            )));
        }
        grads.clip_norm(max_grad_norm);
        self.optimizer.step(&mut self.online, &grads);
        Ok(loss)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            self.online.clone(),
            self.target.clone(),
            self.optimizer.clone(),
            self.epsilon,
            self.steps_done,
        )
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            network: self.online.clone(),
            epsilon: self.epsilon,
            steps_done: self.steps_done,
        }
    }
}

pub struct PolicyEngine {
    snapshot: ArcSwap<PolicySnapshot>,
    learner: Mutex<Learner>,
    replay: ReplayMemory,
    log: ExperienceLog,
    explore_rng: Mutex<ChaCha8Rng>,
    settings: EngineSettings,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("PolicyEngine")
            .field("num_replicas", &self.settings.num_replicas)
            .field("epsilon", &snapshot.epsilon)
            .field("steps_done", &snapshot.steps_done)
            .field("buffer_size", &self.replay.len())
            .finish()
    }
}

impl PolicyEngine {
    /// Fresh engine with randomly initialized weights. Periodic checkpoints
    /// are written to `checkpoint_path` when one is given.
    pub fn new(config: &RouterConfig, checkpoint_path: Option<PathBuf>) -> Self {
        let policy = &config.policy;
        let settings = EngineSettings {
            num_replicas: config.router.num_replicas.max(1),
            hidden_size: policy.hidden_size.max(1),
            gamma: policy.gamma as f32,
            epsilon_min: policy.epsilon_min,
            epsilon_decay: policy.epsilon_decay,
            max_grad_norm: policy.max_grad_norm as f32,
            target_sync_interval: policy.target_sync_interval.max(1),
            checkpoint_interval: config.checkpoint.interval,
            checkpoint_attempts: config.checkpoint.write_attempts,
            checkpoint_backoff: config.checkpoint.retry_backoff(),
            checkpoint_path,
        };

        let mut seeder = match policy.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let online = QNetwork::new(
            STATE_DIM,
            settings.hidden_size,
            settings.num_replicas,
            &mut seeder,
        );
        let learner = Learner {
            target: online.clone(),
            optimizer: Adam::new(policy.learning_rate, online.param_count()),
            online,
            epsilon: policy.epsilon_start,
            steps_done: 0,
            rng: ChaCha8Rng::seed_from_u64(seeder.r#gen()),
        };
        let explore_rng = ChaCha8Rng::seed_from_u64(seeder.r#gen());

        Self {
            snapshot: ArcSwap::from_pointee(learner.snapshot()),
            learner: Mutex::new(learner),
            replay: ReplayMemory::new(config.replay.capacity),
            log: ExperienceLog::default(),
            explore_rng: Mutex::new(explore_rng),
            settings,
        }
    }

    pub fn num_replicas(&self) -> usize {
        self.settings.num_replicas
    }

    /// Currently published weights and counters.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// True until the first training step completes.
    pub fn is_cold(&self) -> bool {
        self.snapshot.load().steps_done == 0
    }

    pub fn replay(&self) -> &ReplayMemory {
        &self.replay
    }

    pub fn experience_log(&self) -> &ExperienceLog {
        &self.log
    }

    pub fn q_values(&self, state: &StateVector) -> Vec<f32> {
        self.snapshot.load().network.forward(state.as_slice())
    }

    /// Epsilon-greedy choice over the published network.
    ///
    /// With `explore` false the choice is the argmax (lowest index on ties)
    /// and consumes no randomness. Confidence is the softmax probability of
    /// the chosen replica.
    pub fn select(&self, state: &StateVector, explore: bool) -> Result<Selection, RouterError> {
        let snapshot = self.snapshot.load();
        let q = snapshot.network.forward(state.as_slice());
        if q.is_empty() || q.iter().any(|v| !v.is_finite()) {
            return Err(RouterError::PolicyFault(
                "network produced non-finite Q-values".to_string(),
            ));
        }

        let (exploration, action) = if explore && snapshot.epsilon > 0.0 {
            let mut rng = self.explore_rng.lock();
            if rng.r#gen::<f64>() < snapshot.epsilon {
                (true, rng.gen_range(0..q.len()))
            } else {
                (false, argmax(&q))
            }
        } else {
            (false, argmax(&q))
        };

        Ok(Selection {
            replica: ReplicaId(action),
            confidence: softmax(&q)[action],
            exploration,
            source: SelectionSource::Learned,
        })
    }

    /// Store a terminal-outcome transition for training and in the recent log.
    pub fn remember(
        &self,
        experience: Experience,
        latency_ms: f64,
        success: bool,
    ) -> Result<(), RouterError> {
        if experience.action.index() >= self.settings.num_replicas {
            return Err(RouterError::InvalidReplica {
                replica: experience.action.index(),
                num_replicas: self.settings.num_replicas,
            });
        }
        self.log.record(LoggedExperience {
            state: experience.state,
            action: experience.action,
            reward: experience.reward,
            latency_ms,
            success,
            timestamp: experience.timestamp,
        });
        self.replay.push(experience);
        Ok(())
    }

    pub fn train_step(&self, batch_size: usize) -> Result<f64, RouterError> {
        let mut learner = self.learner.lock();
        self.step_locked(&mut learner, batch_size)
    }

    /// Run up to `iterations` steps. A buffer smaller than `batch_size` ends
    /// the cycle early without error; the report's loss is `None` when no
    /// step ran.
    pub fn train(&self, batch_size: usize, iterations: u32) -> Result<TrainReport, RouterError> {
        let mut learner = self.learner.lock();
        let mut losses = Vec::with_capacity(iterations as usize);
        for _ in 0..iterations {
            match self.step_locked(&mut learner, batch_size) {
                Ok(loss) => losses.push(loss),
                Err(RouterError::InsufficientData {
                    available,
                    requested,
                }) => {
                    debug!(available, requested, "Skipping training cycle");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let loss = if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f64>() / losses.len() as f64)
        };
        Ok(TrainReport {
            loss,
            epsilon: learner.epsilon,
            buffer_size: self.replay.len(),
            steps_done: learner.steps_done,
        })
    }

    fn step_locked(&self, learner: &mut Learner, batch_size: usize) -> Result<f64, RouterError> {
        let batch = self.replay.sample(batch_size, &mut learner.rng)?;
        let loss = learner.fit_batch(
            &batch,
            self.settings.gamma,
            self.settings.max_grad_norm,
        )?;

        let decayed = (learner.epsilon * self.settings.epsilon_decay).max(self.settings.epsilon_min);
        learner.epsilon = learner.epsilon.min(decayed);
        learner.steps_done += 1;

        if learner.steps_done % self.settings.target_sync_interval == 0 {
            learner.target = learner.online.clone();
            info!(steps_done = learner.steps_done, "Synced target network");
        }
        self.snapshot.store(Arc::new(learner.snapshot()));

        let interval = self.settings.checkpoint_interval;
        if interval > 0
            && learner.steps_done % interval == 0
            && let Some(path) = &self.settings.checkpoint_path
        {
            self.write_periodic_checkpoint(learner, path);
        }
        Ok(loss)
    }

    fn write_periodic_checkpoint(&self, learner: &Learner, path: &Path) {
        let checkpoint = learner.checkpoint();
        match save_with_retry(
            &checkpoint,
            path,
            self.settings.checkpoint_attempts,
            self.settings.checkpoint_backoff,
        ) {
            Ok(()) => info!(
                path = %path.display(),
                steps_done = learner.steps_done,
                "Saved policy checkpoint"
            ),
            Err(e) => warn!(
                path = %path.display(),
                error = %format!("{e:#}"),
                "Checkpoint write failed, continuing in memory"
            ),
        }
    }

    /// Operator override of the exploration rate, published immediately.
    pub fn reset_epsilon(&self, value: f64) -> Result<(), RouterError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(RouterError::PolicyFault(format!(
                "epsilon must be within [0, 1] (got {value})"
            )));
        }
        let mut learner = self.learner.lock();
        learner.epsilon = value;
        self.snapshot.store(Arc::new(learner.snapshot()));
        info!(epsilon = value, "Reset exploration rate");
        Ok(())
    }

    pub fn stats(&self) -> PolicyStats {
        let snapshot = self.snapshot.load();
        PolicyStats {
            epsilon: snapshot.epsilon,
            steps_done: snapshot.steps_done,
            buffer_size: self.replay.len(),
            average_recent_reward: self.log.average_recent_reward(),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.learner.lock().checkpoint()
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<(), RouterError> {
        let checkpoint = self.checkpoint();
        save_with_retry(
            &checkpoint,
            path,
            self.settings.checkpoint_attempts,
            self.settings.checkpoint_backoff,
        )
        .map_err(|e| RouterError::Checkpoint(format!("{e:#}")))?;
        info!(path = %path.display(), steps_done = checkpoint.steps_done, "Saved policy checkpoint");
        Ok(())
    }

    /// Replace weights, optimizer state, epsilon and step count from disk.
    /// The current state is left untouched on any error.
    pub fn load_checkpoint(&self, path: &Path) -> Result<(), RouterError> {
        let checkpoint =
            Checkpoint::load(path).map_err(|e| RouterError::Checkpoint(format!("{e:#}")))?;
        let expected = self.settings.expected_shape();
        if checkpoint.shape != expected {
            return Err(RouterError::Checkpoint(format!(
                "checkpoint shape {:?} does not match configured shape {:?}",
                checkpoint.shape, expected
            )));
        }

        let mut learner = self.learner.lock();
        learner.online = checkpoint.online;
        learner.target = checkpoint.target;
        learner.optimizer = checkpoint.optimizer;
        learner.epsilon = checkpoint.epsilon;
        learner.steps_done = checkpoint.steps_done;
        self.snapshot.store(Arc::new(learner.snapshot()));
        info!(
            path = %path.display(),
            steps_done = learner.steps_done,
            epsilon = learner.epsilon,
            "Restored policy checkpoint"
        );
        Ok(())
    }

    /// Startup restore. Any failure leaves the fresh weights in place.
    /// Returns true when a checkpoint was loaded.
    pub fn restore_or_fresh(&self, path: &Path) -> bool {
        if !path.exists() {
            info!(path = %path.display(), "No checkpoint found, starting fresh");
            return false;
        }
        match self.load_checkpoint(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint unreadable, starting fresh");
                false
            }
        }
    }
}

/// Index of the largest value; the first one wins ties.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

fn softmax(values: &[f32]) -> Vec<f64> {
    let max = values
        .iter()
        .map(|v| f64::from(*v))
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| (f64::from(*v) - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
