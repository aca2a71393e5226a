//! Sharing configuration.

use std::time::Duration;

/// Lifecycle settings for a [`SharedSource`](crate::SharedSource).
///
/// - `replay`: how many of the most recent values a new subscriber receives
///   before live values.
/// - `stop_timeout`: grace period between the last subscriber leaving and
///   the producer being stopped.
/// - `replay_expiration`: how long the replay buffer survives once the
///   producer is stopped. `None` keeps it until the source is cleared.
/// - `capacity`: how many undelivered values each subscriber may queue. A
///   subscriber that falls further behind is detached: its stream yields
///   what was already queued and then ends. Never less than `replay` or 1.
///
/// # Examples
///
/// ```rust
/// use wellspring::SharingConfig;
/// use std::time::Duration;
///
/// let config = SharingConfig::new()
///     .with_replay(1)
///     .with_stop_timeout(Duration::from_secs(5))
///     .with_replay_expiration(Duration::from_secs(60));
///
/// assert_eq!(config.replay(), 1);
/// assert_eq!(config.replay_expiration(), Some(Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SharingConfig {
    replay: usize,
    stop_timeout: Duration,
    replay_expiration: Option<Duration>,
    capacity: usize,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            replay: 0,
            stop_timeout: Duration::ZERO,
            replay_expiration: None,
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

impl SharingConfig {
    /// Default per-subscriber queue capacity.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// No replay, immediate stop, buffer retained indefinitely,
    /// [`DEFAULT_CAPACITY`](Self::DEFAULT_CAPACITY) queued values per subscriber.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay the last `count` values to new subscribers.
    pub fn with_replay(mut self, count: usize) -> Self {
        self.replay = count;
        self
    }

    /// Keep the producer running for `timeout` after the last subscriber leaves.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Discard the replay buffer `expiration` after the producer stops.
    pub fn with_replay_expiration(mut self, expiration: Duration) -> Self {
        self.replay_expiration = Some(expiration);
        self
    }

    /// Let each subscriber queue up to `capacity` undelivered values.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Get the replay count.
    pub fn replay(&self) -> usize {
        self.replay
    }

    /// Get the stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Get the replay expiration; `None` means unbounded.
    pub fn replay_expiration(&self) -> Option<Duration> {
        self.replay_expiration
    }

    /// Get the per-subscriber queue capacity as configured.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue size actually used: room for the full replay, and at least one.
    pub(crate) fn queue_size(&self) -> usize {
        self.capacity.max(self.replay).max(1)
    }
}
