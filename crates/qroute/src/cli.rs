use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for CLI responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "qroute")]
#[command(about = "qroute: adaptive replica selection router", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (text or json)
    #[arg(long, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Config file (defaults to the platform config location)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Also write logs to a file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive jobs through simulated replicas with background training
    Simulate {
        /// Number of jobs to route
        #[arg(long, default_value_t = 500)]
        jobs: usize,

        /// Jobs kept in flight at once
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Multiplier applied to every simulated replica latency
        #[arg(long, default_value_t = 1.0)]
        latency_scale: f64,

        /// Seed for the policy and the simulated replicas
        #[arg(long)]
        seed: Option<u64>,

        /// Do not write the checkpoint when the run finishes
        #[arg(long)]
        no_save: bool,
    },

    /// Select a replica for the given load picture using the saved policy
    Select {
        /// In-flight jobs per replica, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        loads: Vec<u64>,

        /// Jobs waiting in the ingress queues
        #[arg(long, default_value_t = 0)]
        queue_depth: u64,

        /// Recent average latency in milliseconds
        #[arg(long, default_value_t = 0.0)]
        latency_ms: f64,

        /// Recent request rate per second
        #[arg(long, default_value_t = 0.0)]
        rps: f64,

        /// Recent success rate, 0-1
        #[arg(long, default_value_t = 1.0)]
        success_rate: f64,

        /// Always exploit, never take a random action
        #[arg(long)]
        greedy: bool,
    },

    /// Show exploration rate, step count and buffer size of the saved policy
    Stats,

    /// Reset the saved policy's exploration rate
    ResetEpsilon {
        /// New exploration rate, 0-1
        #[arg(long, default_value_t = 1.0)]
        value: f64,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (file plus environment overrides)
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration file
    Validate,
}
