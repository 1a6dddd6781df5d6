//! Media worker pool.
//!
//! Each router lives on one worker. New routers go to the worker hosting the
//! fewest routers; ties resolve to the lowest index.

use super::types::WorkerId;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub struct WorkerPool {
    load: Mutex<Vec<usize>>,
}

impl WorkerPool {
    /// Create a pool of `size` workers. A zero size is treated as one.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            load: Mutex::new(vec![0; size.max(1)]),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.load.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Pick the least loaded worker and count one router against it.
    pub fn acquire(&self) -> WorkerId {
        let mut load = self.load.lock().unwrap_or_else(PoisonError::into_inner);
        let (index, _) = load
            .iter()
            .enumerate()
            .min_by_key(|(index, routers)| (**routers, *index))
            .unwrap_or((0, &0));
        if let Some(slot) = load.get_mut(index) {
            *slot += 1;
        }
        debug!(target: "cs.media", worker = index, "Worker selected for router");
        WorkerId(index)
    }

    /// Release one router from `worker`.
    pub fn release(&self, worker: WorkerId) {
        let mut load = self.load.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = load.get_mut(worker.0) {
            *slot = slot.saturating_sub(1);
        }
    }

    /// Routers per worker, by index.
    #[must_use]
    pub fn load_distribution(&self) -> Vec<usize> {
        self.load.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_spreads_over_workers() {
        let pool = WorkerPool::new(3);
        let picked: Vec<usize> = (0..4).map(|_| pool.acquire().0).collect();
        assert_eq!(picked, vec![0, 1, 2, 0]);
        assert_eq!(pool.load_distribution(), vec![2, 1, 1]);
    }

    #[test]
    fn test_release_makes_worker_preferred_again() {
        let pool = WorkerPool::new(2);
        let first = pool.acquire();
        let _second = pool.acquire();
        pool.release(first);
        assert_eq!(pool.acquire(), first);
    }

    #[test]
    fn test_zero_size_pool_has_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.acquire(), WorkerId(0));
        pool.release(WorkerId(7));
    }
}
