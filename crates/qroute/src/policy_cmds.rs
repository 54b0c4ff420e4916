//! Checkpoint-backed operator commands: select, stats, reset-epsilon.

use anyhow::{Context, Result, bail};
use qroute_config::RouterConfig;
use qroute_core::{PolicyStats, Selection, SelectionSource};
use qroute_dispatch::{MemoryPipeline, ReplicaRouter};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cli::OutputFormat;

/// A router over an idle in-memory pipeline, carrying the saved policy.
struct SavedPolicy {
    router: ReplicaRouter,
    checkpoint: PathBuf,
    restored: bool,
}

impl SavedPolicy {
    fn open(config: &RouterConfig) -> Result<Self> {
        let checkpoint = config.checkpoint.resolved_path()?;
        let pipeline = Arc::new(MemoryPipeline::new(
            config.router.num_replicas,
            config.dispatch.completion_ttl(),
        ));
        let router = ReplicaRouter::new(config, pipeline, None);

        let restored = checkpoint.exists();
        if restored {
            router
                .load_checkpoint(&checkpoint)
                .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
        } else {
            debug!(path = %checkpoint.display(), "No checkpoint, using a fresh policy");
        }
        Ok(Self {
            router,
            checkpoint,
            restored,
        })
    }
}

pub(crate) struct SelectArgs {
    pub loads: Vec<u64>,
    pub queue_depth: u64,
    pub latency_ms: f64,
    pub rps: f64,
    pub success_rate: f64,
    pub greedy: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct SelectOutput {
    pub replica: usize,
    pub name: String,
    pub confidence: f64,
    pub exploration: bool,
    pub source: SelectionSource,
    pub checkpoint_restored: bool,
}

impl SelectOutput {
    fn new(selection: &Selection, checkpoint_restored: bool) -> Self {
        Self {
            replica: selection.replica.index(),
            name: selection.replica.name(),
            confidence: selection.confidence,
            exploration: selection.exploration,
            source: selection.source,
            checkpoint_restored,
        }
    }
}

/// Loads are matched to `router.num_replicas`: missing replicas count as
/// idle and extra entries are dropped.
pub(crate) fn select(mut config: RouterConfig, mut args: SelectArgs) -> Result<SelectOutput> {
    let num_replicas = config.router.num_replicas;
    if args.loads.len() != num_replicas {
        warn!(
            given = args.loads.len(),
            num_replicas,
            "Load count does not match router.num_replicas, padding or truncating"
        );
        args.loads.resize(num_replicas, 0);
    }
    if args.greedy {
        config.router.exploration = false;
    }
    let saved = SavedPolicy::open(&config)?;

    // Host memory, CPU and hour come from this machine.
    let mut telemetry = saved.router.telemetry();
    telemetry.replica_loads = args.loads;
    telemetry.queue_depth = args.queue_depth;
    telemetry.avg_latency_ms = args.latency_ms;
    telemetry.requests_per_sec = args.rps;
    telemetry.success_rate = args.success_rate;

    let selection = saved.router.select_with(&telemetry);
    Ok(SelectOutput::new(&selection, saved.restored))
}

#[derive(Debug, Serialize)]
pub(crate) struct StatsOutput {
    #[serde(flatten)]
    pub stats: PolicyStats,
    pub checkpoint: PathBuf,
    pub checkpoint_restored: bool,
}

pub(crate) fn stats(config: &RouterConfig) -> Result<StatsOutput> {
    let saved = SavedPolicy::open(config)?;
    Ok(StatsOutput {
        stats: saved.router.stats(),
        checkpoint: saved.checkpoint,
        checkpoint_restored: saved.restored,
    })
}

/// Rewrite the saved checkpoint with a new exploration rate.
pub(crate) fn reset_epsilon(config: &RouterConfig, value: f64) -> Result<StatsOutput> {
    let saved = SavedPolicy::open(config)?;
    if !saved.restored {
        bail!(
            "No checkpoint at {}. Run 'qroute simulate' or a router first.",
            saved.checkpoint.display()
        );
    }
    saved.router.reset_epsilon(value)?;
    saved
        .router
        .save_checkpoint(&saved.checkpoint)
        .with_context(|| format!("Failed to save checkpoint {}", saved.checkpoint.display()))?;
    Ok(StatsOutput {
        stats: saved.router.stats(),
        checkpoint: saved.checkpoint,
        checkpoint_restored: true,
    })
}

pub(crate) fn print_selection(output: &SelectOutput, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(output)?),
        OutputFormat::Text => println!(
            "{} (index {}) source={} confidence={:.3} exploration={}",
            output.name,
            output.replica,
            source_label(output.source),
            output.confidence,
            output.exploration
        ),
    }
    Ok(())
}

pub(crate) fn print_stats(output: &StatsOutput, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(output)?),
        OutputFormat::Text => {
            println!("epsilon:               {:.4}", output.stats.epsilon);
            println!("steps_done:            {}", output.stats.steps_done);
            println!("buffer_size:           {}", output.stats.buffer_size);
            println!(
                "average_recent_reward: {:.4}",
                output.stats.average_recent_reward
            );
            let origin = if output.checkpoint_restored {
                "restored"
            } else {
                "not found"
            };
            println!(
                "checkpoint:            {} ({origin})",
                output.checkpoint.display()
            );
        }
    }
    Ok(())
}

fn source_label(source: SelectionSource) -> &'static str {
    match source {
        SelectionSource::Learned => "learned",
        SelectionSource::Heuristic => "heuristic",
    }
}
