use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex, PoisonError};

use crate::worker::Worker;

/// A small fixed-capacity pool recycling idle [`Worker`]s across bar
/// lifetimes, so short-lived bars do not pay thread-creation cost on
/// every run.
pub(crate) struct WorkerPool {
    idle: Mutex<VecDeque<Worker>>,
    capacity: usize,
}

impl WorkerPool {
    pub const DEFAULT_CAPACITY: usize = 4;

    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a worker out of the pool, or spawn a fresh jobless one when
    /// the pool is empty. Never blocks on anything but the pool lock.
    pub fn pop(&self) -> Worker {
        let recycled = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.pop_front()
        };
        match recycled {
            Some(worker) => {
                log::trace!("reusing pooled render worker");
                worker
            }
            None => Worker::new(),
        }
    }

    /// Return a worker to the pool. When the pool is already at capacity
    /// the worker is discarded instead, which joins its thread.
    pub fn push(&self, worker: Worker) {
        {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.capacity {
                idle.push_back(worker);
                return;
            }
        }
        // drop outside the lock: joining the thread can take a cycle
        log::trace!("worker pool full, discarding worker");
        drop(worker);
    }

    pub fn size(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// The process-wide pool, torn down at process exit.
pub(crate) static POOL: LazyLock<WorkerPool> =
    LazyLock::new(|| WorkerPool::new(WorkerPool::DEFAULT_CAPACITY));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::State;

    #[test]
    fn pop_on_empty_yields_a_usable_worker() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.size(), 0);
        let worker = pool.pop();
        assert_eq!(worker.state(), State::Dormant);
        worker.appoint(Box::new(|| Ok(()))).unwrap();
        worker.activate().unwrap();
        worker.suspend().unwrap();
    }

    #[test]
    fn push_never_grows_past_capacity() {
        let pool = WorkerPool::new(2);
        for _ in 0..5 {
            pool.push(Worker::new());
        }
        assert_eq!(pool.size(), 2);
        // the pooled workers are still usable after recycling
        let worker = pool.pop();
        worker.appoint(Box::new(|| Ok(()))).unwrap();
        worker.activate().unwrap();
        worker.halt().unwrap();
        pool.push(worker);
        assert_eq!(pool.size(), 2);
    }
}
