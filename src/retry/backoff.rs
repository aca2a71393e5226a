//! The backoff retry controller.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::Stream;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{RetryError, RetryExhausted};
use super::policy::{PolicyError, RetryPolicy};
use super::stream::RetrySession;

type BeforeRetryFn<E> = dyn Fn(&E, u32, u32) + Send + Sync;
type SuccessAfterRetryFn = dyn Fn(u32) + Send + Sync;
type RetriesExhaustedFn<E> = dyn Fn(&E) + Send + Sync;
type RetryConditionFn<E> = dyn Fn(&E, u32, u32) -> bool + Send + Sync;
type CancellationFn<E> = dyn Fn(&E) -> bool + Send + Sync;
type SharedRng = Arc<Mutex<Box<dyn RngCore + Send>>>;

/// Retries failing producers and calls with exponential backoff.
///
/// A `RetryBackoff` pairs a validated [`RetryPolicy`] with optional hooks, a
/// random source for jitter and a cancellation scope. It is cheap to clone;
/// clones share hooks, random source and cancellation token.
///
/// # Hooks
///
/// Hooks are synchronous and should not block; use them for logging and
/// metrics. For each failure they run in this order: `before_retry`, then the
/// `retry_if` condition, then the delay, then the new attempt.
///
/// - `before_retry(cause, attempts, total_attempts)`: a retry is planned.
/// - `retry_if(cause, attempts, total_attempts)`: return `false` to surface
///   `cause` as [`RetryError::Rejected`] instead of retrying.
/// - `retries_exhausted(cause)`: the attempt budget ran out.
/// - `success_after_retry(attempts)`: a stream emitted again after retrying.
///
/// # Cancellation
///
/// Cancelling the token given to [`with_cancellation`](Self::with_cancellation)
/// aborts the in-flight attempt or the pending delay and surfaces
/// [`RetryError::Cancelled`]. Producer errors matched by
/// [`cancel_on`](Self::cancel_on) surface the same way. Neither consults the
/// policy or hooks.
///
/// # Examples
///
/// ```rust
/// use wellspring::{RetryBackoff, RetryPolicy};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let calls = AtomicU32::new(0);
/// let backoff = RetryBackoff::new(RetryPolicy::new(Duration::ZERO).with_max_attempts(5))
///     .unwrap()
///     .before_retry(|err: &String, attempts, _| println!("retry #{}: {}", attempts, err));
///
/// let value = backoff
///     .call(|| async {
///         if calls.fetch_add(1, Ordering::SeqCst) < 2 {
///             Err("not yet".to_string())
///         } else {
///             Ok(42)
///         }
///     })
///     .await;
///
/// assert_eq!(value, Ok(42));
/// assert_eq!(calls.load(Ordering::SeqCst), 3);
/// # });
/// ```
pub struct RetryBackoff<E> {
    policy: RetryPolicy,
    rng: SharedRng,
    cancel: Option<CancellationToken>,
    before_retry: Option<Arc<BeforeRetryFn<E>>>,
    success_after_retry: Option<Arc<SuccessAfterRetryFn>>,
    retries_exhausted: Option<Arc<RetriesExhaustedFn<E>>>,
    retry_condition: Option<Arc<RetryConditionFn<E>>>,
    is_cancellation: Option<Arc<CancellationFn<E>>>,
}

impl<E> RetryBackoff<E> {
    /// Create a controller, rejecting invalid policies.
    pub fn new(policy: RetryPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            policy,
            rng: Arc::new(Mutex::new(Box::new(StdRng::from_os_rng()))),
            cancel: None,
            before_retry: None,
            success_after_retry: None,
            retries_exhausted: None,
            retry_condition: None,
            is_cancellation: None,
        })
    }

    /// Get the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Draw jitter from `rng` instead of an OS-seeded generator.
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Arc::new(Mutex::new(Box::new(rng)));
        self
    }

    /// Abort retrying when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Called before every retry with the cause and both attempt counters.
    pub fn before_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E, u32, u32) + Send + Sync + 'static,
    {
        self.before_retry = Some(Arc::new(hook));
        self
    }

    /// Called once per recovery, with the consecutive attempt count.
    pub fn success_after_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.success_after_retry = Some(Arc::new(hook));
        self
    }

    /// Called with the final cause when the attempt budget runs out.
    pub fn retries_exhausted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.retries_exhausted = Some(Arc::new(hook));
        self
    }

    /// Retry only while `condition` returns true.
    pub fn retry_if<F>(mut self, condition: F) -> Self
    where
        F: Fn(&E, u32, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    /// Treat producer errors matching `predicate` as cancellation.
    pub fn cancel_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_cancellation = Some(Arc::new(predicate));
        self
    }

    /// Wrap a restartable producer.
    ///
    /// `factory` is invoked for the first subscription and again after every
    /// retry delay; each call must return a fresh stream. Errors are
    /// retried per the policy; the returned stream ends after its first
    /// `Err` item, which is always terminal.
    pub fn stream<V, S, F>(&self, factory: F) -> impl Stream<Item = Result<V, RetryError<E>>>
    where
        F: FnMut() -> S,
        S: Stream<Item = Result<V, E>>,
    {
        RetrySession::new(self.clone(), factory).into_stream()
    }

    /// Retry a one-shot fallible operation until it succeeds.
    ///
    /// Every failure advances a single attempt counter. On exhaustion the
    /// returned [`RetryExhausted`] carries all earlier failures in its
    /// `history`.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut history = Vec::new();

        loop {
            let Some(outcome) = self.guarded(operation()).await else {
                return Err(RetryError::Cancelled { cause: None });
            };

            let error = match outcome {
                Ok(value) => {
                    if attempts > 0 {
                        tracing::debug!(attempts, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = self.on_failure(error, attempts, attempts, started, &mut history)?;
            if !self.sleep(delay).await {
                return Err(RetryError::Cancelled { cause: None });
            }
            attempts += 1;
        }
    }

    /// Decide what happens after a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or the terminal
    /// error. A retried cause is pushed onto `history`; a terminal one takes
    /// the accumulated history with it.
    pub(crate) fn on_failure(
        &self,
        error: E,
        attempts: u32,
        total_attempts: u32,
        started: Instant,
        history: &mut Vec<E>,
    ) -> Result<Duration, RetryError<E>> {
        if self.is_cancellation.as_ref().is_some_and(|f| f(&error)) {
            tracing::debug!(attempts, "producer cancelled");
            return Err(RetryError::Cancelled { cause: Some(error) });
        }

        if self.policy.is_exhausted(attempts) {
            tracing::warn!(attempts, total_attempts, "retries exhausted");
            if let Some(hook) = &self.retries_exhausted {
                hook(&error);
            }
            let exhausted = RetryExhausted::new(error, total_attempts + 1, started.elapsed())
                .with_history(std::mem::take(history));
            return Err(RetryError::Exhausted(exhausted));
        }

        let delay = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.policy.delay_for_attempt(attempts, &mut **rng)
        };

        if let Some(hook) = &self.before_retry {
            hook(&error, attempts, total_attempts);
        }

        if let Some(condition) = &self.retry_condition {
            if !condition(&error, attempts, total_attempts) {
                tracing::debug!(attempts, total_attempts, "retry rejected by condition");
                return Err(RetryError::Rejected {
                    cause: error,
                    attempts: total_attempts + 1,
                });
            }
        }

        tracing::debug!(
            attempts,
            total_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        history.push(error);
        Ok(delay)
    }

    pub(crate) fn on_recovered(&self, attempts: u32) {
        tracing::debug!(attempts, "recovered after retry");
        if let Some(hook) = &self.success_after_retry {
            hook(attempts);
        }
    }

    /// Run `future` unless the cancellation scope fires first.
    pub(crate) async fn guarded<F: Future>(&self, future: F) -> Option<F::Output> {
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => None,
                output = future => Some(output),
            },
            None => Some(future.await),
        }
    }

    /// Wait out a retry delay. Returns false if cancelled meanwhile.
    pub(crate) async fn sleep(&self, delay: Duration) -> bool {
        self.guarded(tokio::time::sleep(delay)).await.is_some()
    }
}

impl<E> Clone for RetryBackoff<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            rng: Arc::clone(&self.rng),
            cancel: self.cancel.clone(),
            before_retry: self.before_retry.clone(),
            success_after_retry: self.success_after_retry.clone(),
            retries_exhausted: self.retries_exhausted.clone(),
            retry_condition: self.retry_condition.clone(),
            is_cancellation: self.is_cancellation.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryBackoff<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBackoff")
            .field("policy", &self.policy)
            .field("cancellable", &self.cancel.is_some())
            .field("before_retry", &self.before_retry.is_some())
            .field("success_after_retry", &self.success_after_retry.is_some())
            .field("retries_exhausted", &self.retries_exhausted.is_some())
            .field("retry_condition", &self.retry_condition.is_some())
            .finish_non_exhaustive()
    }
}
