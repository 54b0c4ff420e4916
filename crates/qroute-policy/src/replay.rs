//! Fixed-capacity circular experience store.

use parking_lot::Mutex;
use qroute_core::{Experience, RouterError};
use rand::Rng;

/// Preallocated ring of transitions. Once full, each push overwrites the
/// oldest entry.
#[derive(Debug)]
pub struct ReplayBuffer {
    slots: Vec<Experience>,
    capacity: usize,
    /// Next slot to overwrite once the buffer is full.
    cursor: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn push(&mut self, experience: Experience) {
        if self.slots.len() < self.capacity {
            self.slots.push(experience);
        } else {
            self.slots[self.cursor] = experience;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Uniformly sample `batch_size` distinct entries without removing them.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Experience>, RouterError> {
        if batch_size == 0 || self.slots.len() < batch_size {
            return Err(RouterError::InsufficientData {
                available: self.slots.len(),
                requested: batch_size,
            });
        }
        Ok(rand::seq::index::sample(rng, self.slots.len(), batch_size)
            .into_iter()
            .map(|i| self.slots[i].clone())
            .collect())
    }

    /// Entries from oldest to newest.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &Experience> {
        let split = if self.slots.len() < self.capacity {
            0
        } else {
            self.cursor
        };
        self.slots[split..].iter().chain(self.slots[..split].iter())
    }
}

/// Thread-safe handle around a [`ReplayBuffer`]. Each insert and each sample
/// holds the lock for its whole duration, so batches are never torn.
#[derive(Debug)]
pub struct ReplayMemory {
    inner: Mutex<ReplayBuffer>,
}

impl ReplayMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ReplayBuffer::new(capacity)),
        }
    }

    pub fn push(&self, experience: Experience) {
        self.inner.lock().push(experience);
    }

    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Experience>, RouterError> {
        self.inner.lock().sample(batch_size, rng)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Copy of the stored transitions, oldest first.
    pub fn snapshot(&self) -> Vec<Experience> {
        self.inner.lock().iter_oldest_first().cloned().collect()
    }
}
