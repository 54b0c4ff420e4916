//! Queue-mediated job dispatch with exactly-once load accounting, completion
//! synchronization, live telemetry and background training.

pub mod completion;
pub mod dispatcher;
pub mod load;
pub mod pipeline;
pub mod router;
pub mod telemetry;
pub mod trainer;

pub use completion::{CompletionSynchronizer, JobResult};
pub use dispatcher::{JobDispatcher, PendingJob};
pub use load::{LoadAccountant, LoadLease};
pub use pipeline::{JobPipeline, MemoryPipeline, QueuedJob, ReplicaInbox};
pub use router::ReplicaRouter;
pub use telemetry::{LiveTelemetry, SystemProbe, TelemetryWindow};
pub use trainer::BackgroundTrainer;
