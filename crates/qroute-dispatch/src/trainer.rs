//! Background training cadence, decoupled from the request path.

use qroute_core::TrainReport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::router::ReplicaRouter;

/// Runs `Train(batch_size, iterations)` every `training.interval_secs`, and
/// after every `training.every_completed_jobs` resolved jobs when that
/// trigger is non-zero. Cycles never overlap.
#[derive(Debug)]
pub struct BackgroundTrainer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTrainer {
    pub fn spawn(router: Arc<ReplicaRouter>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let training = router.training_config().clone();
        let every = training.every_completed_jobs;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(training.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut trained_at = router.synchronizer().resolved_jobs();

            loop {
                let due = tokio::select! {
                    _ = ticker.tick() => true,
                    _ = router.synchronizer().job_resolved(), if every > 0 => {
                        router.synchronizer().resolved_jobs().saturating_sub(trained_at) >= every
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        false
                    }
                };
                if !due {
                    continue;
                }
                trained_at = router.synchronizer().resolved_jobs();
                run_cycle(&router, training.batch_size, training.iterations).await;
            }
            debug!("Background trainer stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop after any in-progress cycle finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Background trainer task failed");
        }
    }
}

pub(crate) async fn run_cycle(
    router: &ReplicaRouter,
    batch_size: usize,
    iterations: u32,
) -> Option<TrainReport> {
    match router.train(batch_size, iterations).await {
        Ok(report) => {
            match report.loss {
                Some(loss) => info!(
                    loss,
                    epsilon = report.epsilon,
                    steps_done = report.steps_done,
                    buffer_size = report.buffer_size,
                    "Training cycle finished"
                ),
                None => debug!(buffer_size = report.buffer_size, "Training cycle skipped"),
            }
            Some(report)
        }
        Err(e) => {
            warn!(error = %e, "Training cycle failed");
            None
        }
    }
}
