use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Fixed-capacity worker pool. `try_run` either takes a job or hands it
/// back when every slot is busy; it never queues beyond capacity, so the
/// scheduler keeps unscheduled work in its own queues.
pub struct WorkerPool {
    pool: ThreadPool,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(capacity)
            .thread_name(|idx| format!("gpumux-worker-{idx}"))
            .build()
            .map_err(|err| anyhow!("failed to build worker pool: {}", err))?;
        Ok(Self {
            pool,
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` on a pool worker, or return it when the pool is full.
    pub fn try_run<F>(&self, job: F) -> Option<F>
    where
        F: FnOnce() + Send + 'static,
    {
        let reserved = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.capacity).then_some(count + 1)
            });
        if reserved.is_err() {
            return Some(job);
        }

        let in_flight = self.in_flight.clone();
        self.pool.spawn(move || {
            job();
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        None
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
