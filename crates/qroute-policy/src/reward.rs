//! Reward shaping for completed and failed jobs.

use qroute_config::RewardConfig;

/// Population variance of the per-replica loads. Empty input has zero variance.
pub fn load_variance(loads: &[u64]) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }
    let n = loads.len() as f64;
    let mean = loads.iter().map(|&l| l as f64).sum::<f64>() / n;
    loads
        .iter()
        .map(|&l| {
            let d = l as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardCalculator {
    load_variance_weight: f64,
    failure_penalty: f64,
    latency_scale_ms: f64,
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self::from_config(&RewardConfig::default())
    }
}

impl RewardCalculator {
    pub fn from_config(config: &RewardConfig) -> Self {
        Self {
            load_variance_weight: config.load_variance_weight,
            failure_penalty: config.failure_penalty,
            latency_scale_ms: config.latency_scale_ms,
        }
    }

    pub fn failure_penalty(&self) -> f64 {
        self.failure_penalty
    }

    /// `clamp(1 - latency/scale, -1, 1) - k * var(loads)` on success, the
    /// fixed failure penalty otherwise. `loads` are the in-flight counts at
    /// completion time.
    pub fn reward(&self, latency_ms: f64, success: bool, loads: &[u64]) -> f64 {
        if !success {
            return self.failure_penalty;
        }
        let latency_term = if latency_ms.is_finite() {
            (1.0 - latency_ms.max(0.0) / self.latency_scale_ms).clamp(-1.0, 1.0)
        } else {
            -1.0
        };
        latency_term - self.load_variance_weight * load_variance(loads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_load_variance() {
        assert_eq!(load_variance(&[]), 0.0);
        assert_eq!(load_variance(&[4, 4, 4]), 0.0);
        // mean 2, deviations 1 and 1
        assert_eq!(load_variance(&[1, 3]), 1.0);
        assert!((load_variance(&[5, 3, 7]) - 8.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_fast_balanced_success_is_near_one() {
        let calc = RewardCalculator::default();
        assert!((calc.reward(0.0, true, &[2, 2, 2]) - 1.0).abs() < 1e-12);
        assert!((calc.reward(250.0, true, &[0, 0, 0]) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_slow_success_is_clamped() {
        let calc = RewardCalculator::default();
        assert_eq!(calc.reward(5_000.0, true, &[]), -1.0);
        assert_eq!(calc.reward(f64::INFINITY, true, &[]), -1.0);
        assert_eq!(calc.reward(f64::NAN, true, &[]), -1.0);
    }

    #[test]
    fn test_imbalance_is_penalized() {
        let calc = RewardCalculator::default();
        let balanced = calc.reward(100.0, true, &[3, 3, 3]);
        let skewed = calc.reward(100.0, true, &[0, 0, 9]);
        assert!(skewed < balanced);
        assert!((balanced - skewed - 0.1 * 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_custom_weights() {
        let calc = RewardCalculator::from_config(&RewardConfig {
            load_variance_weight: 0.0,
            failure_penalty: -3.0,
            latency_scale_ms: 500.0,
        });
        assert_eq!(calc.reward(1.0, false, &[]), -3.0);
        assert!((calc.reward(250.0, true, &[0, 100]) - 0.5).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_failure_is_always_minus_ten(
            latency in 0.0f64..100_000.0,
            loads in proptest::collection::vec(0u64..1000, 0..8),
        ) {
            let calc = RewardCalculator::default();
            prop_assert_eq!(calc.reward(latency, false, &loads), -10.0);
        }

        #[test]
        fn prop_reward_decreases_with_latency(
            a in 0.0f64..1999.0,
            delta in 0.5f64..500.0,
            loads in proptest::collection::vec(0u64..50, 0..5),
        ) {
            let b = (a + delta).min(1999.9);
            prop_assume!(b > a);
            let calc = RewardCalculator::default();
            prop_assert!(calc.reward(a, true, &loads) > calc.reward(b, true, &loads));
        }

        #[test]
        fn prop_success_beats_failure(
            latency in 0.0f64..100_000.0,
            loads in proptest::collection::vec(0u64..10, 0..4),
        ) {
            let calc = RewardCalculator::default();
            prop_assert!(calc.reward(latency, true, &loads) > calc.reward(latency, false, &loads));
        }
    }
}
