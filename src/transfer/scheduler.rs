//! Bounded fan-out for per-record store work.
//!
//! Every import stage pushes its records through [`BatchScheduler::process`]:
//! a batch runs concurrently, the scheduler waits for all of it to settle,
//! pauses, then moves on. Batching only shapes store load; results come back in
//! input order regardless of batch size.

use futures::future::join_all;
use std::future::Future;
use std::time::Duration;

/// Default number of records in flight per batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default pause between consecutive batches.
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    batch_size: usize,
    pause: Duration,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_BATCH_PAUSE)
    }
}

impl BatchScheduler {
    /// A zero `batch_size` is treated as one.
    pub fn new(batch_size: usize, pause: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pause,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Run `work` over `items`, one bounded batch at a time.
    pub async fn process<'a, T, R, F, Fut>(&self, items: &'a [T], work: F) -> Vec<R>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut results = Vec::with_capacity(items.len());
        let batch_count = items.len().div_ceil(self.batch_size);

        for (batch_index, batch) in items.chunks(self.batch_size).enumerate() {
            let settled = join_all(batch.iter().map(&work)).await;
            results.extend(settled);

            log::debug!(
                "batch {}/{} settled ({} records)",
                batch_index + 1,
                batch_count,
                batch.len()
            );

            if batch_index + 1 < batch_count && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        results
    }
}
