use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How replicas are chosen. Fixed at startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Epsilon-greedy Q-network, falling back to least connections when cold.
    #[default]
    LearnedPolicy,
    /// Always pick the replica with the fewest in-flight jobs.
    HeuristicLeastConnections,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LearnedPolicy => "learned-policy",
            Self::HeuristicLeastConnections => "heuristic-least-connections",
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "learned-policy" => Ok(Self::LearnedPolicy),
            "heuristic-least-connections" => Ok(Self::HeuristicLeastConnections),
            other => Err(format!(
                "Invalid strategy '{}'. Valid values: learned-policy, heuristic-least-connections",
                other
            )),
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_num_replicas")]
    pub num_replicas: usize,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Epsilon-greedy exploration on the request path. When false the
    /// learned policy always exploits.
    #[serde(default = "default_true")]
    pub exploration: bool,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            num_replicas: default_num_replicas(),
            strategy: SelectionStrategy::default(),
            exploration: true,
        }
    }
}

fn default_num_replicas() -> usize {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub learning_rate: f64,
    pub gamma: f64,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub hidden_size: usize,
    /// Global L2 norm bound applied to gradients before each update.
    pub max_grad_norm: f64,
    /// Copy online weights into the target network every N training steps.
    pub target_sync_interval: u64,
    /// Seed for weight init, exploration and replay sampling. Random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            gamma: 0.99,
            epsilon_start: 1.0,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            hidden_size: 128,
            max_grad_norm: 1.0,
            target_sync_interval: 100,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    /// Training steps per scheduled cycle.
    pub iterations: u32,
    pub interval_secs: u64,
    /// Also run a cycle after this many completed jobs. 0 disables the trigger.
    pub every_completed_jobs: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            iterations: 10,
            interval_secs: 60,
            every_completed_jobs: 0,
        }
    }
}

impl TrainingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint file. Defaults to `<state dir>/policy.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Persist every N training steps. 0 disables periodic checkpoints.
    pub interval: u64,
    pub write_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval: 500,
            write_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl CheckpointConfig {
    /// Configured path, or the platform default under the state directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(p.clone()),
            None => crate::paths::default_checkpoint_path(),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_deadline_secs")]
    pub completion_deadline_secs: u64,
    /// Unconsumed completion records become unreadable after this long.
    #[serde(default = "default_ttl_secs")]
    pub completion_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            completion_deadline_secs: default_deadline_secs(),
            completion_ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    60
}

fn default_ttl_secs() -> u64 {
    60
}

impl DispatchConfig {
    pub fn completion_deadline(&self) -> Duration {
        Duration::from_secs(self.completion_deadline_secs)
    }

    pub fn completion_ttl(&self) -> Duration {
        Duration::from_secs(self.completion_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Weight `k` of the replica-load variance penalty.
    pub load_variance_weight: f64,
    pub failure_penalty: f64,
    /// Latency at which the latency term reaches zero.
    pub latency_scale_ms: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            load_variance_weight: 0.1,
            failure_penalty: -10.0,
            latency_scale_ms: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Window for request-rate and success-rate estimates.
    pub window_secs: u64,
    /// Number of recent latencies averaged into the state.
    pub latency_window: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            latency_window: 100,
        }
    }
}

impl TelemetryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl RouterConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Load from `path`, or from the platform config location when `None`,
    /// then apply `QROUTE_*` environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => match crate::paths::default_config_path() {
                Ok(p) => Self::load(&p)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    /// Write to file, creating parent directories if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QROUTE_NUM_REPLICAS") {
            self.router.num_replicas = parse_var("QROUTE_NUM_REPLICAS", &v)?;
        }
        if let Some(v) = lookup("QROUTE_EXPLORATION") {
            self.router.exploration = parse_bool("QROUTE_EXPLORATION", &v)?;
        }
        if let Some(v) = lookup("QROUTE_STRATEGY") {
            self.router.strategy = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!("QROUTE_STRATEGY: {e}"))?;
        }
        if let Some(v) = lookup("QROUTE_CHECKPOINT_PATH") {
            self.checkpoint.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("QROUTE_TRAINING_INTERVAL") {
            self.training.interval_secs = parse_var("QROUTE_TRAINING_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("QROUTE_BATCH_SIZE") {
            self.training.batch_size = parse_var("QROUTE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("QROUTE_ITERATIONS") {
            self.training.iterations = parse_var("QROUTE_ITERATIONS", &v)?;
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    match value.trim().parse() {
        Ok(v) => Ok(v),
        Err(_) => bail!("Invalid value for {}: '{}'", name, value),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => bail!("Invalid value for {}: '{}' (expected true/false)", name, value),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
