//! On-disk policy checkpoints.
//!
//! A checkpoint is a single JSON document holding both networks, the
//! optimizer moments, epsilon and the step counter. Writes go to a sibling
//! `.tmp` file that is then renamed over the target, so readers never see a
//! partial file.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::network::QNetwork;
use crate::optimizer::Adam;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Layer widths of the online network, input first.
    pub shape: Vec<usize>,
    pub online: QNetwork,
    pub target: QNetwork,
    pub optimizer: Adam,
    pub epsilon: f64,
    pub steps_done: u64,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        online: QNetwork,
        target: QNetwork,
        optimizer: Adam,
        epsilon: f64,
        steps_done: u64,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            shape: online.shape(),
            online,
            target,
            optimizer,
            epsilon,
            steps_done,
            saved_at: Utc::now(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
        }
        let content = serde_json::to_vec(self).context("serializing checkpoint")?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &content)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
        Ok(())
    }

    /// Read and structurally validate a checkpoint. Shape compatibility with
    /// a running policy is checked by the caller.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let checkpoint: Self = serde_json::from_slice(&content)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            bail!(
                "unsupported checkpoint version {} (expected {})",
                checkpoint.version,
                CHECKPOINT_VERSION
            );
        }
        if checkpoint.online.shape() != checkpoint.shape
            || checkpoint.target.shape() != checkpoint.shape
        {
            bail!("checkpoint networks do not match recorded shape {:?}", checkpoint.shape);
        }
        if checkpoint.optimizer.param_count() != checkpoint.online.param_count() {
            bail!(
                "optimizer state has {} moments for {} parameters",
                checkpoint.optimizer.param_count(),
                checkpoint.online.param_count()
            );
        }
        if !(0.0..=1.0).contains(&checkpoint.epsilon) {
            bail!("checkpoint epsilon {} out of range", checkpoint.epsilon);
        }
        Ok(checkpoint)
    }
}

/// Save with up to `attempts` tries, doubling `backoff` between them.
/// Returns the last error if every attempt fails.
pub fn save_with_retry(
    checkpoint: &Checkpoint,
    path: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match checkpoint.save(path) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    attempts,
                    error = %format!("{e:#}"),
                    "Checkpoint write failed, retrying"
                );
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
