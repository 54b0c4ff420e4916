//! Simulated replicas driving the full select/dispatch/learn loop.

use anyhow::{Context, Result};
use chrono::Utc;
use qroute_config::RouterConfig;
use qroute_core::{CompletionRecord, PolicyStats, ReplicaId, RouterError};
use qroute_dispatch::{BackgroundTrainer, JobResult, MemoryPipeline, ReplicaInbox, ReplicaRouter};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::cli::OutputFormat;

/// Latency and reliability of one simulated replica.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct ReplicaProfile {
    pub base_latency_ms: f64,
    pub jitter_ms: f64,
    pub failure_rate: f64,
}

const PROFILES: [ReplicaProfile; 3] = [
    ReplicaProfile {
        base_latency_ms: 40.0,
        jitter_ms: 10.0,
        failure_rate: 0.02,
    },
    ReplicaProfile {
        base_latency_ms: 120.0,
        jitter_ms: 30.0,
        failure_rate: 0.05,
    },
    ReplicaProfile {
        base_latency_ms: 300.0,
        jitter_ms: 100.0,
        failure_rate: 0.20,
    },
];

impl ReplicaProfile {
    /// Profiles repeat every three replicas: fast, steady, slow and flaky.
    pub fn for_replica(replica: ReplicaId) -> Self {
        PROFILES[replica.index() % PROFILES.len()]
    }

    fn sample<R: Rng + ?Sized>(&self, scale: f64, rng: &mut R) -> (f64, bool) {
        let jitter = if self.jitter_ms > 0.0 {
            rng.gen_range(-self.jitter_ms..=self.jitter_ms)
        } else {
            0.0
        };
        let latency_ms = (self.base_latency_ms + jitter).max(1.0) * scale;
        let success = !rng.gen_bool(self.failure_rate);
        (latency_ms, success)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SimulateOptions {
    pub jobs: usize,
    pub concurrency: usize,
    pub latency_scale: f64,
    pub seed: Option<u64>,
    pub save: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub(crate) struct ReplicaTally {
    pub replica: String,
    pub completed: usize,
    pub succeeded: usize,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct SimulationSummary {
    pub jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub errors: usize,
    pub mean_reward: f64,
    pub replicas: Vec<ReplicaTally>,
    pub elapsed_ms: u64,
    pub stats: PolicyStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug)]
struct Tally {
    replicas: Vec<ReplicaTally>,
    latency_sums: Vec<f64>,
    succeeded: usize,
    failed: usize,
    timed_out: usize,
    errors: usize,
    reward_sum: f64,
}

impl Tally {
    fn new(num_replicas: usize) -> Self {
        Self {
            replicas: (0..num_replicas)
                .map(|i| ReplicaTally {
                    replica: ReplicaId(i).name(),
                    ..ReplicaTally::default()
                })
                .collect(),
            latency_sums: vec![0.0; num_replicas],
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            errors: 0,
            reward_sum: 0.0,
        }
    }

    fn observe(&mut self, outcome: Result<JobResult, RouterError>) {
        match outcome {
            Ok(result) => {
                let i = result.replica.index();
                if let Some(tally) = self.replicas.get_mut(i) {
                    tally.completed += 1;
                    if result.record.success {
                        tally.succeeded += 1;
                    }
                    self.latency_sums[i] += result.latency_ms;
                }
                if result.record.success {
                    self.succeeded += 1;
                } else {
                    self.failed += 1;
                }
                self.reward_sum += result.reward;
            }
            Err(RouterError::JobTimeout { job_id, .. }) => {
                warn!(job_id = %job_id, "Simulated job timed out");
                self.timed_out += 1;
            }
            Err(e) => {
                warn!(error = %e, "Simulated job failed to route");
                self.errors += 1;
            }
        }
    }

    fn resolved(&self) -> usize {
        self.succeeded + self.failed
    }

    fn finish(mut self) -> (Vec<ReplicaTally>, f64, (usize, usize, usize, usize)) {
        for (tally, sum) in self.replicas.iter_mut().zip(&self.latency_sums) {
            if tally.completed > 0 {
                tally.mean_latency_ms = sum / tally.completed as f64;
            }
        }
        let mean_reward = match self.resolved() {
            0 => 0.0,
            n => self.reward_sum / n as f64,
        };
        let counts = (self.succeeded, self.failed, self.timed_out, self.errors);
        (self.replicas, mean_reward, counts)
    }
}

fn spawn_replica(
    mut inbox: ReplicaInbox,
    pipeline: Arc<MemoryPipeline>,
    latency_scale: f64,
    seed: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let replica = inbox.replica();
        let profile = ReplicaProfile::for_replica(replica);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        while let Some(job) = inbox.recv().await {
            let (latency_ms, success) = profile.sample(latency_scale, &mut rng);
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(latency_ms / 1000.0)).await;
                let record = CompletionRecord {
                    job_id: job.job_id,
                    success,
                    worker: replica.name(),
                    latency_ms,
                    response: success.then(|| "ok".to_string()),
                    error: (!success).then(|| "simulated failure".to_string()),
                    completed_at: Utc::now(),
                };
                if let Err(e) = pipeline.post_completion(record) {
                    warn!(replica = %replica, error = %e, "Failed to post completion");
                }
            });
        }
    })
}

pub(crate) async fn run_simulation(
    mut config: RouterConfig,
    options: SimulateOptions,
) -> Result<SimulationSummary> {
    if options.seed.is_some() {
        config.policy.seed = options.seed;
    }
    let num_replicas = config.router.num_replicas;
    let checkpoint = if options.save {
        Some(config.checkpoint.resolved_path()?)
    } else {
        None
    };

    let pipeline = Arc::new(MemoryPipeline::new(
        num_replicas,
        config.dispatch.completion_ttl(),
    ));
    let router = Arc::new(ReplicaRouter::new(
        &config,
        pipeline.clone(),
        checkpoint.clone(),
    ));

    let base_seed = options.seed.unwrap_or_else(rand::random);
    let mut workers = Vec::with_capacity(num_replicas);
    for i in 0..num_replicas {
        let inbox = pipeline
            .take_inbox(ReplicaId(i))
            .context("replica inbox already taken")?;
        workers.push(spawn_replica(
            inbox,
            Arc::clone(&pipeline),
            options.latency_scale,
            base_seed.wrapping_add(i as u64 + 1),
        ));
    }
    let trainer = BackgroundTrainer::spawn(Arc::clone(&router));

    info!(
        jobs = options.jobs,
        concurrency = options.concurrency,
        num_replicas,
        strategy = %config.router.strategy,
        "Starting simulation"
    );
    let started = Instant::now();
    let next = Arc::new(AtomicUsize::new(0));
    let mut clients = JoinSet::new();
    for _ in 0..options.concurrency.max(1) {
        let router = Arc::clone(&router);
        let next = Arc::clone(&next);
        let jobs = options.jobs;
        clients.spawn(async move {
            let mut outcomes = Vec::new();
            loop {
                let n = next.fetch_add(1, Ordering::Relaxed);
                if n >= jobs {
                    break;
                }
                outcomes.push(router.route(serde_json::json!({ "job": n })).await);
            }
            outcomes
        });
    }

    let mut tally = Tally::new(num_replicas);
    while let Some(joined) = clients.join_next().await {
        for outcome in joined.context("simulation client task failed")? {
            tally.observe(outcome);
        }
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    trainer.shutdown().await;
    for worker in &workers {
        worker.abort();
    }

    // One last cycle so short runs still leave a trained policy behind.
    let training = router.training_config().clone();
    match router.train(training.batch_size, training.iterations).await {
        Ok(report) => info!(steps_done = report.steps_done, loss = ?report.loss, "Final training cycle"),
        Err(e) => warn!(error = %e, "Final training cycle failed"),
    }

    if let Some(path) = &checkpoint {
        router
            .persist_checkpoint(path.clone())
            .await
            .with_context(|| format!("Failed to save checkpoint {}", path.display()))?;
        info!(path = %path.display(), "Saved policy checkpoint");
    }

    let stats = router.stats();
    let (replicas, mean_reward, (succeeded, failed, timed_out, errors)) = tally.finish();
    Ok(SimulationSummary {
        jobs: options.jobs,
        succeeded,
        failed,
        timed_out,
        errors,
        mean_reward,
        replicas,
        elapsed_ms,
        stats,
        checkpoint,
    })
}

pub(crate) fn print_summary(summary: &SimulationSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => {
            println!(
                "{} jobs in {} ms: {} succeeded, {} failed, {} timed out, {} errors",
                summary.jobs,
                summary.elapsed_ms,
                summary.succeeded,
                summary.failed,
                summary.timed_out,
                summary.errors
            );
            println!("mean reward: {:.4}", summary.mean_reward);
            for r in &summary.replicas {
                println!(
                    "  {:<10} completed={:<6} succeeded={:<6} mean_latency_ms={:.1}",
                    r.replica, r.completed, r.succeeded, r.mean_latency_ms
                );
            }
            println!(
                "epsilon={:.4} steps_done={} buffer_size={} average_recent_reward={:.4}",
                summary.stats.epsilon,
                summary.stats.steps_done,
                summary.stats.buffer_size,
                summary.stats.average_recent_reward
            );
            if let Some(path) = &summary.checkpoint {
                println!("checkpoint: {}", path.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(dir: &std::path::Path) -> RouterConfig {
        let mut config = RouterConfig::default();
        config.policy.hidden_size = 8;
        config.training.batch_size = 8;
        config.training.iterations = 5;
        config.training.every_completed_jobs = 10;
        config.checkpoint.path = Some(dir.join("policy.json"));
        config
    }

    fn options(jobs: usize, save: bool) -> SimulateOptions {
        SimulateOptions {
            jobs,
            concurrency: 4,
            latency_scale: 0.05,
            seed: Some(42),
            save,
        }
    }

    #[test]
    fn test_profiles_cycle_every_three_replicas() {
        assert_eq!(
            ReplicaProfile::for_replica(ReplicaId(0)),
            ReplicaProfile::for_replica(ReplicaId(3))
        );
        assert!(
            ReplicaProfile::for_replica(ReplicaId(0)).base_latency_ms
                < ReplicaProfile::for_replica(ReplicaId(2)).base_latency_ms
        );
    }

    #[test]
    fn test_profile_sample_respects_bounds() {
        let profile = ReplicaProfile::for_replica(ReplicaId(1));
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut failures = 0;
        for _ in 0..2000 {
            let (latency, success) = profile.sample(1.0, &mut rng);
            assert!((90.0..=150.0).contains(&latency), "latency {latency}");
            if !success {
                failures += 1;
            }
        }
        // 5% failure rate, loose bounds.
        assert!((40..=180).contains(&failures), "failures {failures}");
    }

    #[tokio::test]
    async fn test_simulation_resolves_every_job_and_saves_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let config = small_config(tmp.path());

        let summary = run_simulation(config, options(40, true)).await.unwrap();
        assert_eq!(summary.succeeded + summary.failed, 40);
        assert_eq!(summary.timed_out + summary.errors, 0);
        assert_eq!(
            summary.replicas.iter().map(|r| r.completed).sum::<usize>(),
            40
        );
        assert_eq!(summary.stats.buffer_size, 40);
        assert!(summary.stats.steps_done > 0);
        assert!(summary.stats.epsilon < 1.0);
        assert!(tmp.path().join("policy.json").exists());
    }

    #[tokio::test]
    async fn test_simulation_without_save_leaves_no_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let config = small_config(tmp.path());

        let summary = run_simulation(config, options(12, false)).await.unwrap();
        assert_eq!(summary.succeeded + summary.failed, 12);
        assert!(summary.checkpoint.is_none());
        assert!(!tmp.path().join("policy.json").exists());
    }
}
