//! Per-replica in-flight counters.
//!
//! Every dispatched job holds a [`LoadLease`]. The lease adds one to its
//! replica's counter when acquired and subtracts one exactly once: either on
//! an explicit [`LoadLease::release`] or when the lease is dropped.

use qroute_core::{ReplicaId, RouterError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

#[derive(Debug)]
pub struct LoadAccountant {
    counters: Vec<AtomicU64>,
}

impl LoadAccountant {
    pub fn new(num_replicas: usize) -> Self {
        Self {
            counters: (0..num_replicas).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn num_replicas(&self) -> usize {
        self.counters.len()
    }

    fn counter(&self, replica: ReplicaId) -> Result<&AtomicU64, RouterError> {
        self.counters
            .get(replica.index())
            .ok_or(RouterError::InvalidReplica {
                replica: replica.index(),
                num_replicas: self.counters.len(),
            })
    }

    pub fn increment(&self, replica: ReplicaId) -> Result<(), RouterError> {
        self.counter(replica)?.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Subtract one. Decrementing a zero counter is a bookkeeping defect: it
    /// trips a debug assertion and otherwise saturates at zero.
    pub fn decrement(&self, replica: ReplicaId) -> Result<(), RouterError> {
        let counter = self.counter(replica)?;
        if let Err(current) =
            counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            error!(%replica, current, "In-flight counter would go negative");
            debug_assert!(current > 0, "in-flight counter for {replica} would go negative");
        }
        Ok(())
    }

    pub fn load(&self, replica: ReplicaId) -> u64 {
        self.counter(replica)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.snapshot().iter().sum()
    }

    /// Increment `replica` and return the guard that owns the matching
    /// decrement.
    pub fn acquire(self: &Arc<Self>, replica: ReplicaId) -> Result<LoadLease, RouterError> {
        self.increment(replica)?;
        Ok(LoadLease {
            accountant: Arc::clone(self),
            replica,
            released: false,
        })
    }
}

/// One unit of in-flight load on a replica.
pub struct LoadLease {
    accountant: Arc<LoadAccountant>,
    replica: ReplicaId,
    released: bool,
}

impl std::fmt::Debug for LoadLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadLease")
            .field("replica", &self.replica)
            .field("released", &self.released)
            .finish()
    }
}

impl LoadLease {
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give the load back now. Later calls and the eventual drop are no-ops.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // The replica was validated when the lease was acquired.
        let _ = self.accountant.decrement(self.replica);
    }
}

impl Drop for LoadLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_increment_and_decrement() {
        let accountant = LoadAccountant::new(3);
        accountant.increment(ReplicaId(1)).unwrap();
        accountant.increment(ReplicaId(1)).unwrap();
        accountant.increment(ReplicaId(2)).unwrap();
        assert_eq!(accountant.snapshot(), vec![0, 2, 1]);

        accountant.decrement(ReplicaId(1)).unwrap();
        assert_eq!(accountant.load(ReplicaId(1)), 1);
        assert_eq!(accountant.total(), 2);
    }

    #[test]
    fn test_unknown_replica_rejected() {
        let accountant = LoadAccountant::new(2);
        let err = accountant.increment(ReplicaId(2)).unwrap_err();
        assert!(matches!(
            err,
            RouterError::InvalidReplica {
                replica: 2,
                num_replicas: 2
            }
        ));
        assert_eq!(accountant.load(ReplicaId(9)), 0);
    }

    #[test]
    fn test_lease_releases_once() {
        let accountant = Arc::new(LoadAccountant::new(2));
        let mut lease = accountant.acquire(ReplicaId(0)).unwrap();
        assert_eq!(accountant.load(ReplicaId(0)), 1);

        lease.release();
        lease.release();
        assert!(lease.is_released());
        assert_eq!(accountant.load(ReplicaId(0)), 0);

        drop(lease);
        assert_eq!(accountant.load(ReplicaId(0)), 0);
    }

    #[test]
    fn test_dropped_lease_releases() {
        let accountant = Arc::new(LoadAccountant::new(2));
        {
            let _a = accountant.acquire(ReplicaId(1)).unwrap();
            let _b = accountant.acquire(ReplicaId(1)).unwrap();
            assert_eq!(accountant.load(ReplicaId(1)), 2);
        }
        assert_eq!(accountant.load(ReplicaId(1)), 0);
    }

    #[test]
    fn test_acquire_unknown_replica_leaves_counters_alone() {
        let accountant = Arc::new(LoadAccountant::new(1));
        assert!(accountant.acquire(ReplicaId(3)).is_err());
        assert_eq!(accountant.snapshot(), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_leases_balance() {
        let accountant = Arc::new(LoadAccountant::new(3));
        let mut handles = Vec::new();
        for t in 0..32usize {
            let accountant = Arc::clone(&accountant);
            handles.push(tokio::spawn(async move {
                for i in 0..100usize {
                    let mut lease = accountant.acquire(ReplicaId((t + i) % 3)).unwrap();
                    tokio::task::yield_now().await;
                    if i % 2 == 0 {
                        lease.release();
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(accountant.snapshot(), vec![0, 0, 0]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(usize),
        Release(usize),
        Drop(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3).prop_map(Op::Acquire),
            (0usize..16).prop_map(Op::Release),
            (0usize..16).prop_map(Op::Drop),
        ]
    }

    proptest! {
        #[test]
        fn prop_counter_equals_issued_minus_released(ops in proptest::collection::vec(op_strategy(), 0..80)) {
            let accountant = Arc::new(LoadAccountant::new(3));
            let mut leases: Vec<LoadLease> = Vec::new();
            let mut issued = [0u64; 3];
            let mut returned = [0u64; 3];

            for op in ops {
                match op {
                    Op::Acquire(r) => {
                        leases.push(accountant.acquire(ReplicaId(r)).unwrap());
                        issued[r] += 1;
                    }
                    Op::Release(i) if !leases.is_empty() => {
                        let idx = i % leases.len();
                        let lease = &mut leases[idx];
                        if !lease.is_released() {
                            returned[lease.replica().index()] += 1;
                        }
                        lease.release();
                    }
                    Op::Drop(i) if !leases.is_empty() => {
                        let lease = leases.swap_remove(i % leases.len());
                        if !lease.is_released() {
                            returned[lease.replica().index()] += 1;
                        }
                        drop(lease);
                    }
                    _ => {}
                }
                for r in 0..3 {
                    prop_assert_eq!(accountant.load(ReplicaId(r)), issued[r] - returned[r]);
                }
            }

            drop(leases);
            prop_assert_eq!(accountant.snapshot(), vec![0, 0, 0]);
        }
    }
}
