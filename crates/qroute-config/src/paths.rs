//! Platform default locations for config and persisted policy state.

use anyhow::{Context, Result};
use std::path::PathBuf;

pub const APP_NAME: &str = "qroute";

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .context("Failed to determine project directories")
}

/// `~/.config/qroute/qroute.toml` on Linux.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("qroute.toml"))
}

/// `~/.local/state/qroute` on Linux.
pub fn state_dir() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    // state_dir() is Linux-only; fall back to data_local_dir() elsewhere.
    Ok(dirs
        .state_dir()
        .unwrap_or_else(|| dirs.data_local_dir())
        .to_path_buf())
}

pub fn default_checkpoint_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("policy.json"))
}
