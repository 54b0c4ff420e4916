use anyhow::{Result, bail};

use crate::config::RouterConfig;

/// Validate a loaded configuration.
/// Returns Ok(()) if valid, or Err naming the first offending field.
pub fn validate_config(config: &RouterConfig) -> Result<()> {
    validate_router(config)?;
    validate_policy(config)?;
    validate_training(config)?;
    validate_checkpoint(config)?;
    validate_dispatch(config)?;
    validate_reward(config)?;
    Ok(())
}

fn validate_router(config: &RouterConfig) -> Result<()> {
    if config.router.num_replicas == 0 {
        bail!("router.num_replicas must be > 0 (got 0)");
    }
    if config.router.num_replicas > 3 {
        tracing::warn!(
            num_replicas = config.router.num_replicas,
            "Only the first three replica loads are represented in the policy state"
        );
    }
    Ok(())
}

fn validate_policy(config: &RouterConfig) -> Result<()> {
    let p = &config.policy;
    if !(p.learning_rate > 0.0 && p.learning_rate.is_finite()) {
        bail!("policy.learning_rate must be a positive number (got {})", p.learning_rate);
    }
    if !(0.0..=1.0).contains(&p.gamma) {
        bail!("policy.gamma must be within [0, 1] (got {})", p.gamma);
    }
    if !(0.0..=1.0).contains(&p.epsilon_start) {
        bail!("policy.epsilon_start must be within [0, 1] (got {})", p.epsilon_start);
    }
    if !(0.0..=1.0).contains(&p.epsilon_min) {
        bail!("policy.epsilon_min must be within [0, 1] (got {})", p.epsilon_min);
    }
    if p.epsilon_min > p.epsilon_start {
        bail!(
            "policy.epsilon_min ({}) cannot exceed policy.epsilon_start ({})",
            p.epsilon_min,
            p.epsilon_start
        );
    }
    if !(p.epsilon_decay > 0.0 && p.epsilon_decay <= 1.0) {
        bail!("policy.epsilon_decay must be within (0, 1] (got {})", p.epsilon_decay);
    }
    if p.hidden_size == 0 {
        bail!("policy.hidden_size must be > 0 (got 0)");
    }
    if !(p.max_grad_norm > 0.0) {
        bail!("policy.max_grad_norm must be > 0 (got {})", p.max_grad_norm);
    }
    if p.target_sync_interval == 0 {
        bail!("policy.target_sync_interval must be > 0 (got 0)");
    }
    Ok(())
}

fn validate_training(config: &RouterConfig) -> Result<()> {
    let capacity = config.replay.capacity;
    if capacity == 0 {
        bail!("replay.capacity must be > 0 (got 0)");
    }
    let t = &config.training;
    if t.batch_size == 0 {
        bail!("training.batch_size must be > 0 (got 0)");
    }
    if t.batch_size > capacity {
        bail!(
            "training.batch_size ({}) cannot exceed replay.capacity ({}); \
             training would never run.",
            t.batch_size,
            capacity
        );
    }
    if t.iterations == 0 {
        bail!("training.iterations must be > 0 (got 0)");
    }
    if t.interval_secs == 0 {
        bail!("training.interval_secs must be > 0 (got 0)");
    }
    Ok(())
}

fn validate_checkpoint(config: &RouterConfig) -> Result<()> {
    if config.checkpoint.write_attempts == 0 {
        bail!("checkpoint.write_attempts must be > 0 (got 0)");
    }
    Ok(())
}

fn validate_dispatch(config: &RouterConfig) -> Result<()> {
    if config.dispatch.completion_deadline_secs == 0 {
        bail!("dispatch.completion_deadline_secs must be > 0 (got 0)");
    }
    if config.dispatch.completion_ttl_secs == 0 {
        bail!("dispatch.completion_ttl_secs must be > 0 (got 0)");
    }
    Ok(())
}

fn validate_reward(config: &RouterConfig) -> Result<()> {
    let r = &config.reward;
    if !(r.failure_penalty < 0.0) {
        bail!("reward.failure_penalty must be negative (got {})", r.failure_penalty);
    }
    if !(r.load_variance_weight >= 0.0 && r.load_variance_weight.is_finite()) {
        bail!(
            "reward.load_variance_weight must be >= 0 (got {})",
            r.load_variance_weight
        );
    }
    if !(r.latency_scale_ms > 0.0) {
        bail!("reward.latency_scale_ms must be > 0 (got {})", r.latency_scale_ms);
    }
    Ok(())
}
