//! Retry with exponential backoff for producers and fallible calls.
//!
//! A [`RetryPolicy`] is pure data describing *when* to retry. A
//! [`RetryBackoff`] validates the policy, carries the hooks, random source and
//! cancellation scope, and drives the retry loop:
//!
//! - [`RetryBackoff::stream`] re-subscribes to a failing stream, built fresh by
//!   a factory for every attempt.
//! - [`RetryBackoff::call`] re-issues a one-shot fallible operation.
//!
//! # Quick Start
//!
//! ```rust
//! use futures::StreamExt;
//! use wellspring::{RetryBackoff, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let backoff = RetryBackoff::new(RetryPolicy::new(Duration::ZERO).with_max_attempts(3)).unwrap();
//!
//! let mut connects = 0;
//! let values: Vec<_> = backoff
//!     .stream(|| {
//!         connects += 1;
//!         let fail = connects < 3;
//!         futures::stream::iter(if fail { vec![Err("dropped")] } else { vec![Ok(1), Ok(2)] })
//!     })
//!     .collect()
//!     .await;
//!
//! assert_eq!(values, vec![Ok(1), Ok(2)]);
//! assert_eq!(connects, 3);
//! # });
//! ```
//!
//! # Delay Calculation
//!
//! The n-th retry waits `min(min_delay * backoff_factor^n, max_delay)`. With a
//! non-zero jitter factor `j` the wait is drawn uniformly from
//! `[max(min_delay, base - base*j), min(max_delay, base + base*j)]`, so jitter
//! never pushes a delay outside the configured bounds.
//!
//! # Error Types
//!
//! - [`RetryError`]: terminal failure (cancelled, rejected or exhausted)
//! - [`RetryExhausted`]: the attempt budget ran out; holds the final error and metadata
//! - [`PolicyError`]: the policy failed validation

mod backoff;
mod error;
mod policy;
mod stream;

pub use backoff::RetryBackoff;
pub use error::{RetryError, RetryExhausted};
pub use policy::{PolicyError, RetryPolicy};
