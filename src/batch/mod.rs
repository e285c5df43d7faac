//! # Bulk Execution Module
//!
//! Runs a list of items through a [`RetryHandler`](crate::retry::RetryHandler) in
//! fixed-size batches and aggregates the outcome.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchConfig`] | Batch size, stop-on-failure flag and strategy |
//! | [`BatchExecutor`] | Partitions items and executes every batch with retries |
//! | [`BatchResult`] | Successful results plus failed batches with their items and errors |
//! | [`BatchStrategy`] | Sequential, or up to N batches in flight |
//!
//! ## Example
//!
//! ```rust
//! use apiguard::batch::BatchConfig;
//! use apiguard::classify::ErrorClass;
//! use apiguard::retry::{RetryConfig, RetryHandler};
//!
//! # async fn run() -> apiguard::Result<()> {
//! let handler = RetryHandler::new(RetryConfig::new())?;
//! let symbols = vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"];
//!
//! let result = handler
//!     .execute_bulk(symbols, &BatchConfig::new().with_batch_size(2), |batch| async move {
//!         Ok::<_, ErrorClass>(batch.into_iter().map(|s| s.len()).collect::<Vec<_>>())
//!     })
//!     .await?;
//! assert!(result.all_succeeded());
//! # Ok(())
//! # }
//! ```

mod executor;

pub use executor::{BatchConfig, BatchExecutor, BatchFailure, BatchResult, BatchStrategy};
