//! Keyed sharing of expensive producers.
//!
//! A [`SharedSource`] maps keys to producers built on demand by a builder
//! function. All subscribers of one key share one running producer:
//!
//! - the producer starts when the first subscriber attaches;
//! - it stops [`stop_timeout`](SharingConfig::stop_timeout) after the last
//!   subscriber leaves, unless someone re-attaches in the meantime;
//! - the last [`replay`](SharingConfig::replay) values are handed to every new
//!   subscriber, and survive the producer for
//!   [`replay_expiration`](SharingConfig::replay_expiration).
//!
//! [`StateSource`] is the variant for producers of a current value: every key
//! starts from an initial value and equal consecutive values are conflated.
//!
//! # Quick Start
//!
//! ```rust
//! use futures::StreamExt;
//! use wellspring::{SharedSource, SharingConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let source = SharedSource::new(
//!     SharingConfig::new().with_replay(1).with_stop_timeout(Duration::from_secs(5)),
//!     |symbol: &String| futures::stream::iter(vec![format!("{}:101", symbol)]),
//! );
//!
//! let quotes = source.get("ACME".to_string());
//! assert_eq!(quotes, source.get("ACME".to_string()));
//!
//! let mut subscription = quotes.subscribe();
//! assert_eq!(subscription.next().await, Some("ACME:101".to_string()));
//! # });
//! ```
//!
//! # Producers and runtimes
//!
//! Producers and lifecycle timers are tokio tasks. [`SharedSource::new`] uses
//! the runtime it is called on; [`SharedSource::with_runtime`] takes an
//! explicit [`Handle`](tokio::runtime::Handle). Once the source, its stream
//! handles and its subscriptions are all dropped, its producers stop.

mod config;
mod source;
mod state;
mod subscription;

pub use config::SharingConfig;
pub use source::{SharedSource, SharedStream};
pub use state::{StateSource, StateStream};
pub use subscription::Subscription;

#[cfg(test)]
mod tests;
