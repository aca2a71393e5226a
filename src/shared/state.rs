//! Shared sources that always hold a current value.

use std::fmt;
use std::hash::Hash;

use futures::Stream;
use tokio::runtime::Handle;

use super::config::SharingConfig;
use super::source::{box_builder, SharedSource, SharedStream};
use super::subscription::Subscription;

/// A [`SharedSource`] whose streams always have a value.
///
/// Every key starts at `initial`; a new subscriber receives the current
/// value first. Consecutive equal values are conflated. The replay count of
/// the given configuration is forced to one.
///
/// # Examples
///
/// ```rust
/// use futures::StreamExt;
/// use wellspring::{SharingConfig, StateSource};
///
/// # tokio_test::block_on(async {
/// let source = StateSource::new(0, SharingConfig::new(), |_: &String| {
///     futures::stream::iter(vec![1, 1, 2])
/// });
///
/// let values: Vec<i32> = source.get("counter".to_string()).subscribe().collect().await;
/// assert_eq!(values, vec![0, 1, 2]);
/// # });
/// ```
pub struct StateSource<K, V> {
    shared: SharedSource<K, V>,
    initial: V,
}

/// A [`SharedStream`] with a current value.
pub struct StateStream<K, V> {
    stream: SharedStream<K, V>,
    initial: V,
}

impl<K, V> StateSource<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Create a state source on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub fn new<F, S>(initial: V, config: SharingConfig, builder: F) -> Self
    where
        F: Fn(&K) -> S + Send + Sync + 'static,
        S: Stream<Item = V> + Send + 'static,
    {
        Self::with_runtime(Handle::current(), initial, config, builder)
    }

    /// Create a state source whose producers run on `runtime`.
    pub fn with_runtime<F, S>(runtime: Handle, initial: V, config: SharingConfig, builder: F) -> Self
    where
        F: Fn(&K) -> S + Send + Sync + 'static,
        S: Stream<Item = V> + Send + 'static,
    {
        let shared = SharedSource::from_parts(
            runtime,
            config.with_replay(1),
            box_builder(builder),
            Some(initial.clone()),
            Some(Box::new(|last: &V, next: &V| last == next)),
        );
        Self { shared, initial }
    }

    /// Get the state stream for `key`.
    pub fn get(&self, key: K) -> StateStream<K, V> {
        StateStream {
            stream: self.shared.get(key),
            initial: self.initial.clone(),
        }
    }

    /// Snapshot of the streams that currently have an entry.
    pub fn all(&self) -> Vec<StateStream<K, V>> {
        self.shared
            .all()
            .into_iter()
            .map(|stream| StateStream {
                stream,
                initial: self.initial.clone(),
            })
            .collect()
    }

    /// Stop every producer and reset every key to the initial value.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// The underlying shared source.
    pub fn shared(&self) -> &SharedSource<K, V> {
        &self.shared
    }
}

impl<K, V> StateStream<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// The key this stream is bound to.
    pub fn key(&self) -> &K {
        self.stream.key()
    }

    /// The current value: the last one produced, or the initial value.
    pub fn value(&self) -> V {
        self.stream
            .latest()
            .unwrap_or_else(|| self.initial.clone())
    }

    /// Attach a new subscriber; it receives the current value first.
    pub fn subscribe(&self) -> Subscription<V> {
        self.stream.subscribe()
    }

    /// Number of subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.stream.subscriber_count()
    }
}

impl<K: Clone, V: Clone> Clone for StateSource<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            initial: self.initial.clone(),
        }
    }
}

impl<K: Clone, V: Clone> Clone for StateStream<K, V> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            initial: self.initial.clone(),
        }
    }
}

impl<K: PartialEq, V> PartialEq for StateStream<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream
    }
}

impl<K, V: fmt::Debug> fmt::Debug for StateSource<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSource")
            .field("shared", &self.shared)
            .field("initial", &self.initial)
            .finish()
    }
}

impl<K: fmt::Debug, V> fmt::Debug for StateStream<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStream")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
