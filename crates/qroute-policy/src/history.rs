//! Bounded log of recent routing outcomes, kept for diagnostics and the
//! recent-reward statistic.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qroute_core::{ReplicaId, StateVector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Number of trailing entries averaged by [`ExperienceLog::average_recent_reward`].
pub const RECENT_REWARD_WINDOW: usize = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedExperience {
    pub state: StateVector,
    pub action: ReplicaId,
    pub reward: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ExperienceLog {
    entries: Mutex<VecDeque<LoggedExperience>>,
    capacity: usize,
}

impl Default for ExperienceLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl ExperienceLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, entry: LoggedExperience) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Mean reward of the last [`RECENT_REWARD_WINDOW`] entries, 0 when empty.
    pub fn average_recent_reward(&self) -> f64 {
        let entries = self.entries.lock();
        let take = entries.len().min(RECENT_REWARD_WINDOW);
        if take == 0 {
            return 0.0;
        }
        entries.iter().rev().take(take).map(|e| e.reward).sum::<f64>() / take as f64
    }

    /// Newest `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<LoggedExperience> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }
}
