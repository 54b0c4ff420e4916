use anyhow::{Context, Result, bail};
use qroute_config::{RouterConfig, validate_config};
use std::path::{Path, PathBuf};

use crate::cli::OutputFormat;

/// `--config` when given, otherwise the platform default location.
pub(crate) fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p.to_path_buf()),
        None => qroute_config::paths::default_config_path(),
    }
}

/// File (or defaults), then `QROUTE_*` overrides, then validation.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<RouterConfig> {
    let config = RouterConfig::load_with_env(explicit)?;
    validate_config(&config).context("Invalid configuration")?;
    Ok(config)
}

pub(crate) fn handle_config_show(explicit: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = RouterConfig::load_with_env(explicit)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

pub(crate) fn handle_config_init(explicit: Option<&Path>, force: bool) -> Result<PathBuf> {
    let path = config_path(explicit)?;
    if path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    RouterConfig::default().save(&path)?;
    eprintln!("Initialized configuration at: {}", path.display());
    Ok(path)
}

pub(crate) fn handle_config_validate(explicit: Option<&Path>) -> Result<()> {
    let path = config_path(explicit)?;
    if !path.exists() {
        bail!(
            "No configuration found at {}. Run 'qroute config init' first.",
            path.display()
        );
    }
    let config = RouterConfig::load(&path)?;
    validate_config(&config)?;
    eprintln!("Configuration is valid: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_defaults_and_refuses_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("qroute.toml");

        let written = handle_config_init(Some(&path), false).unwrap();
        assert_eq!(written, path);
        assert_eq!(RouterConfig::load(&path).unwrap(), RouterConfig::default());

        let err = handle_config_init(Some(&path), false).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");
        assert!(handle_config_init(Some(&path), true).is_ok());
    }

    #[test]
    fn test_validate_reports_missing_and_invalid_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("qroute.toml");
        assert!(handle_config_validate(Some(&path)).is_err());

        std::fs::write(&path, "[router]\nnum_replicas = 0\n").unwrap();
        let err = handle_config_validate(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("num_replicas"), "{err}");

        std::fs::write(&path, "[router]\nnum_replicas = 4\n").unwrap();
        assert!(handle_config_validate(Some(&path)).is_ok());
    }

    #[test]
    fn test_load_config_wraps_validation_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("qroute.toml");
        std::fs::write(&path, "[training]\nbatch_size = 0\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration");
        assert!(format!("{err:#}").contains("batch_size"));
    }
}
