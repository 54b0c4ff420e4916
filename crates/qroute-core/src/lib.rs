//! Shared domain types and errors for adaptive replica selection.

pub mod error;
pub mod types;

pub use error::RouterError;
pub use types::{
    CompletionRecord, Experience, JobId, LOAD_SLOTS, PolicyStats, ReplicaId, STATE_DIM, Selection,
    SelectionSource, StateVector, Telemetry, TrainReport,
};
