use anyhow::Result;
use clap::Parser;

mod cli;
mod config_cmds;
mod logging;
mod policy_cmds;
mod simulate_cmd;

use cli::{Cli, Commands, ConfigCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Keep the file writer alive until exit so buffered lines get flushed.
    let _log_guard = logging::init(cli.log_dir.as_deref())?;
    let format = cli.format;
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Simulate {
            jobs,
            concurrency,
            latency_scale,
            seed,
            no_save,
        } => {
            let config = config_cmds::load_config(config_path)?;
            let options = simulate_cmd::SimulateOptions {
                jobs,
                concurrency,
                latency_scale,
                seed,
                save: !no_save,
            };
            let summary = simulate_cmd::run_simulation(config, options).await?;
            simulate_cmd::print_summary(&summary, format)?;
        }
        Commands::Select {
            loads,
            queue_depth,
            latency_ms,
            rps,
            success_rate,
            greedy,
        } => {
            let config = config_cmds::load_config(config_path)?;
            let args = policy_cmds::SelectArgs {
                loads,
                queue_depth,
                latency_ms,
                rps,
                success_rate,
                greedy,
            };
            let output = policy_cmds::select(config, args)?;
            policy_cmds::print_selection(&output, format)?;
        }
        Commands::Stats => {
            let config = config_cmds::load_config(config_path)?;
            let output = policy_cmds::stats(&config)?;
            policy_cmds::print_stats(&output, format)?;
        }
        Commands::ResetEpsilon { value } => {
            let config = config_cmds::load_config(config_path)?;
            let output = policy_cmds::reset_epsilon(&config, value)?;
            policy_cmds::print_stats(&output, format)?;
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Show => config_cmds::handle_config_show(config_path, format)?,
            ConfigCommands::Init { force } => {
                config_cmds::handle_config_init(config_path, force)?;
            }
            ConfigCommands::Validate => config_cmds::handle_config_validate(config_path)?,
        },
    }

    Ok(())
}
