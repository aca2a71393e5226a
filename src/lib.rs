//! # Wellspring
//!
//! > *"Draw from one spring, however many come to drink"*
//!
//! A Rust library for resilient, shared asynchronous producers.
//!
//! ## Philosophy
//!
//! Expensive producers (network feeds, database listeners, sensor streams)
//! should be opened once, survive transient failures, and close as soon as
//! nobody listens:
//! - **Retry** = re-open a failing producer with exponential backoff
//!   ([`RetryBackoff`])
//! - **Share** = one producer per key, fanned out to every subscriber
//!   ([`SharedSource`])
//!
//! ## Quick Example
//!
//! ```rust
//! use futures::StreamExt;
//! use wellspring::{RetryBackoff, RetryPolicy, SharedSource, SharingConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let backoff = RetryBackoff::<String>::new(
//!     RetryPolicy::new(Duration::from_millis(10)).with_max_attempts(5),
//! )
//! .unwrap();
//!
//! // One retried producer per symbol, shared by every subscriber
//! let prices = SharedSource::new(SharingConfig::new().with_replay(1), move |symbol: &String| {
//!     let symbol = symbol.clone();
//!     backoff.stream(move || futures::stream::iter(vec![Ok(format!("{}=42", symbol))]))
//! });
//!
//! let first = prices.get("ACME".to_string()).subscribe().next().await;
//! assert_eq!(first, Some(Ok("ACME=42".to_string())));
//! # });
//! ```
//!
//! ## Modules
//!
//! - [`retry`]: backoff policies and the retry loop for streams and calls
//! - [`shared`]: keyed shared sources with replay and stop timeouts
//! - [`testing`]: hook recorders and producer counters for tests

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod retry;
pub mod shared;
pub mod testing;

// Re-exports
pub use retry::{PolicyError, RetryBackoff, RetryError, RetryExhausted, RetryPolicy};
pub use shared::{SharedSource, SharedStream, SharingConfig, StateSource, StateStream, Subscription};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::retry::{RetryBackoff, RetryError, RetryPolicy};
    pub use crate::shared::{SharedSource, SharedStream, SharingConfig, StateSource, StateStream};
}
