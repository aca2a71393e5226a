//! Error types for retry operations.

use std::time::Duration;

/// Error returned when the attempt budget runs out.
///
/// Contains the final error along with metadata about the retry sequence.
/// The single-call variant also keeps every earlier failure in
/// [`history`](Self::history), oldest first, so the whole retry sequence can
/// be inspected from the terminal error.
///
/// # Examples
///
/// ```rust
/// use wellspring::{RetryBackoff, RetryError, RetryPolicy};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let policy = RetryPolicy::new(Duration::ZERO).with_max_attempts(2);
/// let backoff = RetryBackoff::new(policy).unwrap();
///
/// let result = backoff
///     .call(|| async { Err::<(), _>("always fails") })
///     .await;
///
/// match result {
///     Err(RetryError::Exhausted(exhausted)) => {
///         assert_eq!(exhausted.final_error, "always fails");
///         assert_eq!(exhausted.attempts, 3); // 1 initial + 2 retries
///         assert_eq!(exhausted.history.len(), 2);
///     }
///     other => panic!("Expected exhaustion, got {:?}", other),
/// }
/// # });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    /// The error from the final attempt.
    pub final_error: E,
    /// Total number of attempts made (initial + retries).
    pub attempts: u32,
    /// Total time spent retrying.
    pub total_duration: Duration,
    /// Earlier failures, oldest first. Empty for streaming retries.
    pub history: Vec<E>,
}

impl<E> RetryExhausted<E> {
    /// Create a new RetryExhausted error.
    pub fn new(final_error: E, attempts: u32, total_duration: Duration) -> Self {
        Self {
            final_error,
            attempts,
            total_duration,
            history: Vec::new(),
        }
    }

    /// Attach the failures that preceded the final one.
    pub fn with_history(mut self, history: Vec<E>) -> Self {
        self.history = history;
        self
    }

    /// Extract the final error, discarding metadata.
    pub fn into_error(self) -> E {
        self.final_error
    }

    /// Get a reference to the final error.
    pub fn error(&self) -> &E {
        &self.final_error
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retry exhausted after {} attempts ({:?}): {}",
            self.attempts, self.total_duration, self.final_error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.final_error)
    }
}

/// Terminal failure of a retried producer or call.
///
/// Cancellation is kept distinct from business failures so callers can tell
/// shutdown apart from an error worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The retry scope was cancelled, or the producer failed with an error
    /// classified as cancellation. Never retried.
    Cancelled {
        /// The producer error that signalled cancellation, if any.
        cause: Option<E>,
    },
    /// The retry condition vetoed another attempt.
    Rejected {
        /// The error the condition refused to retry.
        cause: E,
        /// Total number of attempts made (initial + retries).
        attempts: u32,
    },
    /// The attempt budget ran out.
    Exhausted(RetryExhausted<E>),
}

impl<E> RetryError<E> {
    /// Returns true if this error is a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns true if the attempt budget ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    /// Get the underlying producer error, if there is one.
    pub fn cause(&self) -> Option<&E> {
        match self {
            Self::Cancelled { cause } => cause.as_ref(),
            Self::Rejected { cause, .. } => Some(cause),
            Self::Exhausted(exhausted) => Some(&exhausted.final_error),
        }
    }

    /// Extract the underlying producer error, if there is one.
    pub fn into_cause(self) -> Option<E> {
        match self {
            Self::Cancelled { cause } => cause,
            Self::Rejected { cause, .. } => Some(cause),
            Self::Exhausted(exhausted) => Some(exhausted.final_error),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled { cause: None } => write!(f, "retry cancelled"),
            Self::Cancelled { cause: Some(cause) } => write!(f, "retry cancelled: {}", cause),
            Self::Rejected { cause, attempts } => write!(
                f,
                "retry rejected after {} attempts: {}",
                attempts, cause
            ),
            Self::Exhausted(exhausted) => write!(f, "{}", exhausted),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled { cause } => cause
                .as_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            Self::Rejected { cause, .. } => Some(cause),
            Self::Exhausted(exhausted) => Some(exhausted),
        }
    }
}
