//! Bounded worker pool for per-node plugin evaluation.

use crate::{Result, SchedulerError};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Default number of scoring workers
pub const DEFAULT_PARALLELISM: usize = 16;

/// Fixed-size pool shared by every scheduling cycle
pub struct Parallelizer {
    pool: ThreadPool,
    workers: usize,
}

impl Parallelizer {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("skutter-score-{}", i))
            .build()
            .map_err(|e| {
                SchedulerError::internal_error(format!("failed to start scoring workers: {}", e))
            })?;

        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `f` to every item on the pool. Results keep the input order;
    /// the first error seen stops the remaining work and is returned.
    pub fn map<T, R, E, F>(&self, items: &[T], f: F) -> std::result::Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> std::result::Result<R, E> + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(f).collect())
    }
}

impl std::fmt::Debug for Parallelizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallelizer")
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_map_keeps_order() {
        let pool = Parallelizer::new(4).unwrap();
        let items: Vec<i64> = (0..100).collect();

        let doubled: std::result::Result<Vec<i64>, String> = pool.map(&items, |i| Ok(i * 2));
        assert_eq!(doubled.unwrap(), items.iter().map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_map_returns_error() {
        let pool = Parallelizer::new(4).unwrap();
        let calls = AtomicUsize::new(0);
        let items: Vec<i64> = (0..1000).collect();

        let result: std::result::Result<Vec<i64>, String> = pool.map(&items, |i| {
            calls.fetch_add(1, Ordering::Relaxed);
            if *i == 3 {
                Err(format!("bad item {}", i))
            } else {
                Ok(*i)
            }
        });
        assert_eq!(result.unwrap_err(), "bad item 3");
        assert!(calls.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_worker_count() {
        let pool = Parallelizer::new(DEFAULT_PARALLELISM).unwrap();
        assert_eq!(pool.workers(), 16);
    }
}
