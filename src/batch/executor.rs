//! Batch executor.

use crate::classify::Classify;
use crate::retry::{RetryError, RetryHandler};
use crate::{Error, ErrorContext, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    Sequential,
    Concurrent { max_concurrency: usize },
}
impl Default for BatchStrategy {
    fn default() -> Self {
        BatchStrategy::Sequential
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Stop after the first failed batch. Forces sequential processing.
    pub stop_on_failure: bool,
    pub strategy: BatchStrategy,
}
impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            stop_on_failure: false,
            strategy: BatchStrategy::default(),
        }
    }
}
impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_batch_size(mut self, s: usize) -> Self {
        self.batch_size = s;
        self
    }
    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }
    pub fn with_strategy(mut self, s: BatchStrategy) -> Self {
        self.strategy = s;
        self
    }
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::validation_with_context(
                "batch_size must be at least 1",
                ErrorContext::new()
                    .with_field_path("batch.batch_size")
                    .with_source("batch_executor"),
            ));
        }
        if let BatchStrategy::Concurrent { max_concurrency: 0 } = self.strategy {
            return Err(Error::validation_with_context(
                "max_concurrency must be at least 1",
                ErrorContext::new()
                    .with_field_path("batch.strategy.max_concurrency")
                    .with_source("batch_executor"),
            ));
        }
        Ok(())
    }
}

/// A batch whose retries were exhausted, with the items it carried.
#[derive(Debug)]
pub struct BatchFailure<T, E> {
    pub batch_index: usize,
    pub items: Vec<T>,
    pub error: RetryError<E>,
}

#[derive(Debug)]
pub struct BatchResult<T, R, E> {
    /// Results of successful batches, in batch order.
    pub successes: Vec<R>,
    pub failures: Vec<BatchFailure<T, E>>,
    pub total_batches: usize,
    pub processed_batches: usize,
    pub execution_time: Duration,
}

impl<T, R, E> BatchResult<T, R, E> {
    pub fn new() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
            total_batches: 0,
            processed_batches: 0,
            execution_time: Duration::ZERO,
        }
    }
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && self.processed_batches == self.total_batches
    }
    pub fn success_count(&self) -> usize {
        self.successes.len()
    }
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
    /// Every item from failed batches, paired with its batch's error.
    pub fn failed_items(&self) -> impl Iterator<Item = (&T, &RetryError<E>)> {
        self.failures
            .iter()
            .flat_map(|f| f.items.iter().map(move |item| (item, &f.error)))
    }
    /// Share of processed batches that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.processed_batches == 0 {
            0.0
        } else {
            (self.processed_batches - self.failures.len()) as f64 / self.processed_batches as f64
        }
    }
}
impl<T, R, E> Default for BatchResult<T, R, E> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BatchExecutor {
    config: BatchConfig,
}
impl BatchExecutor {
    pub fn new() -> Self {
        Self {
            config: BatchConfig::default(),
        }
    }
    pub fn with_config(config: BatchConfig) -> Self {
        Self { config }
    }
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Partition `items` and run every batch through `handler`.
    pub async fn execute<T, R, E, F, Fut>(
        &self,
        handler: &RetryHandler,
        items: Vec<T>,
        operation: F,
    ) -> Result<BatchResult<T, R, E>>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<R>, E>>,
        E: Classify + fmt::Display,
    {
        self.config.validate()?;
        let start = Instant::now();
        let batches: Vec<Vec<T>> = items
            .chunks(self.config.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let mut result = BatchResult::new();
        result.total_batches = batches.len();

        let operation = &operation;
        let run = move |index: usize, batch: Vec<T>| async move {
            let outcome = handler.execute(|| operation(batch.clone())).await;
            (index, batch, outcome)
        };

        let max_concurrency = match self.config.strategy {
            BatchStrategy::Concurrent { max_concurrency } if !self.config.stop_on_failure => {
                max_concurrency
            }
            _ => 1,
        };

        if max_concurrency == 1 {
            for (index, batch) in batches.into_iter().enumerate() {
                let (index, batch, outcome) = run(index, batch).await;
                let failed = outcome.is_err();
                Self::collect(&mut result, index, batch, outcome);
                if failed && self.config.stop_on_failure {
                    warn!(batch = index, "batch failed, stopping bulk run");
                    break;
                }
            }
        } else {
            let mut outcomes = futures::stream::iter(batches.into_iter().enumerate())
                .map(|(index, batch)| run(index, batch))
                .buffered(max_concurrency);
            while let Some((index, batch, outcome)) = outcomes.next().await {
                Self::collect(&mut result, index, batch, outcome);
            }
        }

        result.execution_time = start.elapsed();
        debug!(
            batches = result.total_batches,
            failed = result.failures.len(),
            elapsed_ms = result.execution_time.as_millis() as u64,
            "bulk run finished"
        );
        Ok(result)
    }

    fn collect<T, R, E>(
        result: &mut BatchResult<T, R, E>,
        index: usize,
        batch: Vec<T>,
        outcome: std::result::Result<Vec<R>, RetryError<E>>,
    ) {
        result.processed_batches += 1;
        match outcome {
            Ok(values) => result.successes.extend(values),
            Err(error) => result.failures.push(BatchFailure {
                batch_index: index,
                items: batch,
                error,
            }),
        }
    }
}
impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClass;
    use crate::retry::{RetryConfig, RetryStrategy};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn handler() -> RetryHandler {
        RetryHandler::new(
            RetryConfig::new()
                .with_max_retries(1)
                .with_strategy(RetryStrategy::FixedDelay)
                .with_base_delay(Duration::ZERO)
                .with_jitter(false),
        )
        .unwrap()
    }

    /// Doubles every symbol id; any batch containing 13 fails permanently.
    async fn double(batch: Vec<u32>) -> std::result::Result<Vec<u32>, ErrorClass> {
        if batch.contains(&13) {
            Err(ErrorClass::Permanent)
        } else {
            Ok(batch.into_iter().map(|x| x * 2).collect())
        }
    }

    #[tokio::test]
    async fn test_all_batches_succeed() {
        let executor = BatchExecutor::with_config(BatchConfig::new().with_batch_size(3));
        let result = executor
            .execute(&handler(), (1..=7).collect(), double)
            .await
            .unwrap();
        assert_eq!(result.total_batches, 3);
        assert!(result.all_succeeded());
        assert_eq!(result.successes, vec![2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(result.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_items() {
        let executor = BatchExecutor::with_config(BatchConfig::new().with_batch_size(2));
        let result = executor
            .execute(&handler(), vec![1, 2, 13, 4, 5, 6], double)
            .await
            .unwrap();
        assert_eq!(result.processed_batches, 3);
        assert_eq!(result.successes, vec![2, 4, 10, 12]);
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.failures[0].batch_index, 1);
        let failed: Vec<u32> = result.failed_items().map(|(item, _)| *item).collect();
        assert_eq!(failed, vec![13, 4]);
        assert!(!result.all_succeeded());
    }

    #[tokio::test]
    async fn test_stop_on_failure() {
        let config = BatchConfig::new()
            .with_batch_size(2)
            .with_stop_on_failure(true)
            .with_strategy(BatchStrategy::Concurrent { max_concurrency: 4 });
        let result = BatchExecutor::with_config(config)
            .execute(&handler(), vec![13, 2, 3, 4, 5, 6], double)
            .await
            .unwrap();
        assert_eq!(result.total_batches, 3);
        assert_eq!(result.processed_batches, 1);
        assert!(result.successes.is_empty());
        assert_eq!(result.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_preserves_order() {
        let config = BatchConfig::new()
            .with_batch_size(1)
            .with_strategy(BatchStrategy::Concurrent { max_concurrency: 3 });
        let result = BatchExecutor::with_config(config)
            .execute(&handler(), (1..=6).collect(), double)
            .await
            .unwrap();
        assert_eq!(result.successes, vec![2, 4, 6, 8, 10, 12]);
    }

    #[tokio::test]
    async fn test_transient_batch_is_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = BatchExecutor::new()
            .execute(&handler(), vec!["BTC", "ETH"], move |batch| async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ErrorClass::Transient)
                } else {
                    Ok(batch.into_iter().map(str::len).collect::<Vec<_>>())
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.successes, vec![3, 3]);
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let executor = BatchExecutor::with_config(BatchConfig::new().with_batch_size(0));
        let result = executor.execute(&handler(), vec![1u32], double).await;
        assert!(result.is_err());
    }
}
