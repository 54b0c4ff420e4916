//! Learned replica-selection policy: state encoding, Q-network, experience
//! replay, reward shaping and the least-connections fallback.

pub mod checkpoint;
pub mod engine;
pub mod heuristic;
pub mod history;
pub mod network;
pub mod optimizer;
pub mod replay;
pub mod reward;
pub mod state;

pub use checkpoint::{CHECKPOINT_VERSION, Checkpoint, save_with_retry};
pub use engine::{PolicyEngine, PolicySnapshot};
pub use heuristic::{heuristic_selection, least_loaded};
pub use history::{ExperienceLog, LoggedExperience};
pub use network::QNetwork;
pub use optimizer::Adam;
pub use replay::{ReplayBuffer, ReplayMemory};
pub use reward::{RewardCalculator, load_variance};
pub use state::StateCollector;
