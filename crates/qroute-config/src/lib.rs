//! Router configuration loading and validation (qroute.toml).

pub mod config;
pub mod paths;
pub mod validate;

pub use config::{
    CheckpointConfig, DispatchConfig, PolicyConfig, ReplayConfig, RewardConfig, RouterConfig,
    RouterSection, SelectionStrategy, TelemetryConfig, TrainingConfig,
};
pub use validate::validate_config;
