//! Testing utilities and helpers for Wellspring
//!
//! This module provides helpers for testing code built on retried producers
//! and shared sources. Pair them with `#[tokio::test(start_paused = true)]`
//! so delays and timers run on tokio's virtual clock.
//!
//! # Examples
//!
//! ## Recording retry hooks
//!
//! ```rust
//! use wellspring::testing::{HookCall, HookRecorder};
//! use wellspring::{RetryBackoff, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let recorder = HookRecorder::<&str>::new();
//! let backoff = recorder.attach(
//!     RetryBackoff::new(RetryPolicy::new(Duration::ZERO).with_max_attempts(1)).unwrap(),
//! );
//!
//! let _ = backoff.call(|| async { Err::<(), _>("down") }).await;
//!
//! assert_eq!(recorder.before_retry().len(), 1);
//! assert!(matches!(recorder.calls().last(), Some(HookCall::RetriesExhausted { .. })));
//! # });
//! ```
//!
//! ## Assertion Macros
//!
//! ```rust
//! use wellspring::{assert_cancelled, assert_exhausted, RetryError, RetryExhausted};
//! use std::time::Duration;
//!
//! let cancelled: Result<(), RetryError<&str>> = Err(RetryError::Cancelled { cause: None });
//! assert_cancelled!(cancelled);
//!
//! let exhausted: Result<(), _> =
//!     Err(RetryError::Exhausted(RetryExhausted::new("down", 3, Duration::ZERO)));
//! assert_exhausted!(exhausted);
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;

use crate::RetryBackoff;

/// One hook invocation, stamped with the time since the recorder was created.
#[derive(Debug, Clone, PartialEq)]
pub enum HookCall<E> {
    /// `before_retry(cause, attempts, total_attempts)`.
    BeforeRetry {
        /// The failure about to be retried.
        cause: E,
        /// Attempt counter used for the delay.
        attempts: u32,
        /// Cumulative attempt counter.
        total_attempts: u32,
        /// Time of the call.
        at: Duration,
    },
    /// `retries_exhausted(cause)`.
    RetriesExhausted {
        /// The final failure.
        cause: E,
        /// Time of the call.
        at: Duration,
    },
    /// `success_after_retry(attempts)`.
    SuccessAfterRetry {
        /// Consecutive attempts that preceded the recovery.
        attempts: u32,
        /// Time of the call.
        at: Duration,
    },
}

/// Records every hook a [`RetryBackoff`] fires.
///
/// Timestamps come from `tokio::time::Instant`, so under a paused clock they
/// are exact virtual times.
#[derive(Debug, Clone)]
pub struct HookRecorder<E> {
    start: Instant,
    calls: Arc<Mutex<Vec<HookCall<E>>>>,
}

impl<E: Clone + Send + 'static> HookRecorder<E> {
    /// Create a recorder whose clock starts now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Install recording hooks on `backoff`, replacing any existing ones.
    pub fn attach(&self, backoff: RetryBackoff<E>) -> RetryBackoff<E> {
        let before = self.clone();
        let exhausted = self.clone();
        let success = self.clone();
        backoff
            .before_retry(move |cause, attempts, total_attempts| {
                before.push(HookCall::BeforeRetry {
                    cause: cause.clone(),
                    attempts,
                    total_attempts,
                    at: before.start.elapsed(),
                })
            })
            .retries_exhausted(move |cause| {
                exhausted.push(HookCall::RetriesExhausted {
                    cause: cause.clone(),
                    at: exhausted.start.elapsed(),
                })
            })
            .success_after_retry(move |attempts| {
                success.push(HookCall::SuccessAfterRetry {
                    attempts,
                    at: success.start.elapsed(),
                })
            })
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<HookCall<E>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(cause, attempts, total_attempts, millis)` of each `before_retry` call.
    pub fn before_retry(&self) -> Vec<(E, u32, u32, u128)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HookCall::BeforeRetry {
                    cause,
                    attempts,
                    total_attempts,
                    at,
                } => Some((cause, attempts, total_attempts, at.as_millis())),
                _ => None,
            })
            .collect()
    }

    /// `(cause, millis)` of each `retries_exhausted` call.
    pub fn exhausted(&self) -> Vec<(E, u128)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HookCall::RetriesExhausted { cause, at } => Some((cause, at.as_millis())),
                _ => None,
            })
            .collect()
    }

    /// `(attempts, millis)` of each `success_after_retry` call.
    pub fn successes(&self) -> Vec<(u32, u128)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HookCall::SuccessAfterRetry { attempts, at } => Some((attempts, at.as_millis())),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: HookCall<E>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl<E: Clone + Send + 'static> Default for HookRecorder<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts producers that have started and those still alive.
///
/// Wrap a producer with [`track`](Self::track); the live count drops when
/// the tracked stream is dropped, which is how a shared source stops it.
///
/// ```rust
/// use wellspring::testing::LiveCounter;
///
/// let counter = LiveCounter::new();
/// let tracked = counter.track(futures::stream::iter(vec![1, 2, 3]));
/// assert_eq!((counter.started(), counter.live()), (1, 1));
///
/// drop(tracked);
/// assert_eq!((counter.started(), counter.live()), (1, 0));
/// ```
#[derive(Debug, Clone, Default)]
pub struct LiveCounter {
    started: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl LiveCounter {
    /// Create a counter with nothing started.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `stream` as started and live until it is dropped.
    pub fn track<S: Stream>(&self, stream: S) -> Tracked<S> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Tracked {
            inner: Box::pin(stream),
            live: Arc::clone(&self.live),
        }
    }

    /// How many tracked streams were ever created.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// How many tracked streams are still alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// A stream counted by a [`LiveCounter`].
#[derive(Debug)]
pub struct Tracked<S> {
    inner: Pin<Box<S>>,
    live: Arc<AtomicUsize>,
}

impl<S: Stream> Stream for Tracked<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Assert that a retry result is a cancellation.
///
/// # Example
///
/// ```rust
/// use wellspring::{assert_cancelled, RetryError};
///
/// let result: Result<i32, RetryError<String>> = Err(RetryError::Cancelled { cause: None });
/// assert_cancelled!(result);
/// ```
#[macro_export]
macro_rules! assert_cancelled {
    ($result:expr) => {
        match $result {
            Err($crate::RetryError::Cancelled { .. }) => {}
            other => panic!("Expected Cancelled, got {:?}", other),
        }
    };
}

/// Assert that a retry result ran out of attempts.
///
/// # Example
///
/// ```rust
/// use wellspring::{assert_exhausted, RetryError, RetryExhausted};
/// use std::time::Duration;
///
/// let result: Result<i32, _> =
///     Err(RetryError::Exhausted(RetryExhausted::new("down", 2, Duration::ZERO)));
/// assert_exhausted!(result);
/// ```
#[macro_export]
macro_rules! assert_exhausted {
    ($result:expr) => {
        match $result {
            Err($crate::RetryError::Exhausted(_)) => {}
            other => panic!("Expected Exhausted, got {:?}", other),
        }
    };
}
