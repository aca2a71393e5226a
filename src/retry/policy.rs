//! Retry policy types and delay calculation.

use std::time::Duration;

use rand::Rng;

/// A backoff policy describing how a failing producer is retried.
///
/// Policies are pure data: they describe retry timing but don't execute it.
/// [`RetryBackoff`](crate::RetryBackoff) validates the policy when it is
/// constructed and drives the retry loop.
///
/// # Attempt counting
///
/// Attempts are counted as *retries already performed*. The first failure is
/// observed with a counter of `0`; a failure observed with a counter equal to
/// [`max_attempts`](Self::max_attempts) is terminal. A producer may therefore
/// fail up to `max_attempts` times in a row and still succeed.
///
/// With [`transient`](Self::transient) counting (the default) the counter is
/// the number of consecutive failures since the last successful emission;
/// otherwise it is the cumulative count for the whole session.
///
/// # Examples
///
/// ```rust
/// use wellspring::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(5))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.base_delay(0), Duration::from_secs(1));
/// assert_eq!(policy.base_delay(1), Duration::from_secs(2));
/// assert_eq!(policy.base_delay(2), Duration::from_secs(4));
/// assert_eq!(policy.base_delay(3), Duration::from_secs(5)); // capped
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    min_delay: Duration,
    #[cfg_attr(feature = "serde", serde(default))]
    max_delay: Option<Duration>,
    #[cfg_attr(feature = "serde", serde(default))]
    max_attempts: Option<u32>,
    #[cfg_attr(feature = "serde", serde(default = "default_backoff_factor"))]
    backoff_factor: f64,
    #[cfg_attr(feature = "serde", serde(default = "default_jitter_factor"))]
    jitter_factor: f64,
    #[cfg_attr(feature = "serde", serde(default = "default_transient"))]
    transient: bool,
}

const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

#[cfg(feature = "serde")]
fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

#[cfg(feature = "serde")]
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

#[cfg(feature = "serde")]
fn default_transient() -> bool {
    true
}

/// Reasons a [`RetryPolicy`] is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// The jitter factor lies outside `[0, 1]`.
    JitterOutOfRange(f64),
    /// `max_attempts` was set to zero.
    ZeroMaxAttempts,
    /// The backoff factor is not a finite number greater than `1.0`.
    BackoffFactorTooSmall(f64),
    /// The minimum delay is larger than the maximum delay.
    MinDelayExceedsMax {
        /// Configured minimum delay.
        min_delay: Duration,
        /// Configured maximum delay.
        max_delay: Duration,
    },
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JitterOutOfRange(factor) => {
                write!(f, "jitter factor {} is outside [0, 1]", factor)
            }
            Self::ZeroMaxAttempts => write!(f, "max attempts must be at least 1"),
            Self::BackoffFactorTooSmall(factor) => {
                write!(f, "backoff factor {} must be greater than 1.0", factor)
            }
            Self::MinDelayExceedsMax {
                min_delay,
                max_delay,
            } => write!(
                f,
                "min delay {:?} exceeds max delay {:?}",
                min_delay, max_delay
            ),
        }
    }
}

impl std::error::Error for PolicyError {}

impl RetryPolicy {
    /// Create a policy starting at `min_delay`.
    ///
    /// Defaults: backoff factor `2.0`, jitter factor `0.1`, transient
    /// counting, no delay cap and no attempt budget.
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: None,
            max_attempts: None,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            transient: true,
        }
    }

    /// Cap every delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Stop retrying once the attempt counter reaches `max_attempts`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use wellspring::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(Duration::from_millis(100)).with_max_attempts(3);
    ///
    /// assert!(!policy.is_exhausted(2));
    /// assert!(policy.is_exhausted(3));
    /// ```
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Multiply the delay by `factor` after every retry.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Randomize each delay by up to `±factor` of its base value.
    ///
    /// The randomized delay never leaves `[min_delay, max_delay]`.
    /// A factor of `0.0` makes delays deterministic.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Choose between transient (consecutive) and cumulative attempt counting.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// Get the minimum delay.
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Get the maximum delay cap, if any.
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Get the attempt budget, if any.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Get the backoff factor.
    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    /// Get the jitter factor.
    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Whether attempts are counted since the last success only.
    pub fn transient(&self) -> bool {
        self.transient
    }

    /// Check the policy invariants.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(PolicyError::JitterOutOfRange(self.jitter_factor));
        }
        if self.max_attempts == Some(0) {
            return Err(PolicyError::ZeroMaxAttempts);
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(PolicyError::BackoffFactorTooSmall(self.backoff_factor));
        }
        if let Some(max_delay) = self.max_delay {
            if self.min_delay > max_delay {
                return Err(PolicyError::MinDelayExceedsMax {
                    min_delay: self.min_delay,
                    max_delay,
                });
            }
        }
        Ok(())
    }

    /// Whether a failure observed with `attempts` retries behind it is terminal.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts == Some(attempts)
    }

    /// The delay before retry number `attempt` without jitter.
    ///
    /// `min_delay * backoff_factor^attempt`, capped at `max_delay`. Values
    /// that overflow saturate to the cap (or [`Duration::MAX`] when uncapped).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.max_delay.unwrap_or(Duration::MAX);
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.min_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        if !secs.is_finite() || secs >= ceiling.as_secs_f64() {
            return ceiling;
        }
        Duration::try_from_secs_f64(secs).map_or(ceiling, |delay| delay.min(ceiling))
    }

    /// The delay before retry number `attempt`, with jitter drawn from `rng`.
    ///
    /// The value is drawn uniformly from
    /// `[max(min_delay, base - base*j), min(max_delay, base + base*j)]`;
    /// a collapsed interval yields its lower bound.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let offset = base_secs * self.jitter_factor;
        let low = (base_secs - offset).max(self.min_delay.as_secs_f64());
        let high = match self.max_delay {
            Some(max) => (base_secs + offset).min(max.as_secs_f64()),
            None => base_secs + offset,
        };

        let secs = if low < high {
            rng.random_range(low..high)
        } else {
            low
        };

        let ceiling = self.max_delay.unwrap_or(Duration::MAX);
        Duration::try_from_secs_f64(secs)
            .map_or(base, |delay| delay.max(self.min_delay).min(ceiling))
    }
}
