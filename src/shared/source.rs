//! Keyed shared sources: one producer per key, many subscribers.

use std::collections::{hash_map, BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::SharingConfig;
use super::subscription::Subscription;

pub(crate) type Builder<K, V> = dyn Fn(&K) -> BoxStream<'static, V> + Send + Sync;
pub(crate) type SameValue<V> = dyn Fn(&V, &V) -> bool + Send + Sync;

/// Multiplexes subscribers of the same key onto a single producer.
///
/// The producer for a key is built lazily, when the first subscriber
/// attaches, and runs as a task on the source's tokio runtime. Every value
/// it yields is delivered, in order, to every attached subscriber. When the
/// last subscriber leaves the producer is stopped after
/// [`stop_timeout`](SharingConfig::stop_timeout); the replay buffer then
/// survives for [`replay_expiration`](SharingConfig::replay_expiration).
///
/// Values are handed to subscribers in attach order, through a queue of
/// [`capacity`](SharingConfig::capacity) values each; the producer never
/// waits for a slow subscriber. A subscriber whose queue is full is detached
/// and its stream ends after the values already queued.
///
/// A producer that ends, or panics, ends the stream of every current subscriber. The
/// entry is kept (with its replay buffer) for the next subscriber, which
/// starts a fresh producer. Producers that can fail should yield `Result`
/// values; wrap the builder with [`RetryBackoff::stream`](crate::RetryBackoff::stream)
/// to make them resilient.
///
/// # Examples
///
/// ```rust
/// use futures::StreamExt;
/// use wellspring::{SharedSource, SharingConfig};
///
/// # tokio_test::block_on(async {
/// let source = SharedSource::new(SharingConfig::new(), |key: &String| {
///     futures::stream::iter(vec![format!("{}-1", key), format!("{}-2", key)])
/// });
///
/// let values: Vec<String> = source.get("feed".to_string()).subscribe().collect().await;
/// assert_eq!(values, vec!["feed-1", "feed-2"]);
/// # });
/// ```
pub struct SharedSource<K, V> {
    inner: Arc<Inner<K, V>>,
}

/// A subscribable handle to the shared stream of one key.
///
/// Handles are cheap; obtaining one does not start anything. Two handles
/// for the same key of the same source compare equal and feed from the
/// same producer.
pub struct SharedStream<K, V> {
    key: K,
    inner: Arc<Inner<K, V>>,
}

pub(crate) struct Inner<K, V> {
    config: SharingConfig,
    runtime: Handle,
    builder: Arc<Builder<K, V>>,
    conflate: Option<Box<SameValue<V>>>,
    registry: Mutex<Registry<K, V>>,
}

struct Registry<K, V> {
    entries: HashMap<K, Entry<V>>,
    seed: Option<V>,
    next_entry: u64,
}

struct Entry<V> {
    id: u64,
    subscribers: BTreeMap<u64, mpsc::Sender<V>>,
    next_subscriber: u64,
    buffer: VecDeque<V>,
    producer: Option<Running>,
    runs: u64,
    timer: Option<JoinHandle<()>>,
    epoch: u64,
}

struct Running {
    run: u64,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Stop,
    Expire,
}

impl<K, V> SharedSource<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a source whose producers run on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub fn new<F, S>(config: SharingConfig, builder: F) -> Self
    where
        F: Fn(&K) -> S + Send + Sync + 'static,
        S: Stream<Item = V> + Send + 'static,
    {
        Self::with_runtime(Handle::current(), config, builder)
    }

    /// Create a source whose producers and timers run on `runtime`.
    pub fn with_runtime<F, S>(runtime: Handle, config: SharingConfig, builder: F) -> Self
    where
        F: Fn(&K) -> S + Send + Sync + 'static,
        S: Stream<Item = V> + Send + 'static,
    {
        Self::from_parts(runtime, config, box_builder(builder), None, None)
    }

    pub(crate) fn from_parts(
        runtime: Handle,
        config: SharingConfig,
        builder: Arc<Builder<K, V>>,
        seed: Option<V>,
        conflate: Option<Box<SameValue<V>>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                builder,
                conflate,
                registry: Mutex::new(Registry {
                    entries: HashMap::new(),
                    seed,
                    next_entry: 0,
                }),
            }),
        }
    }

    /// Get the shared stream for `key`.
    ///
    /// Nothing starts until the returned handle is subscribed to.
    pub fn get(&self, key: K) -> SharedStream<K, V> {
        SharedStream {
            key,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Snapshot of the streams that currently have an entry: a running
    /// producer, a pending timer or a retained replay buffer.
    pub fn all(&self) -> Vec<SharedStream<K, V>> {
        self.inner
            .lock()
            .entries
            .keys()
            .map(|key| self.get(key.clone()))
            .collect()
    }

    /// Stop every producer, end every subscription and drop all buffers.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        tracing::debug!(entries = entries.len(), "clearing shared source");
        drop(entries);
    }

    /// Number of subscribers attached to `key`.
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.inner.subscriber_count(key)
    }

    /// Whether `key` currently has an entry.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Get the sharing configuration.
    pub fn config(&self) -> &SharingConfig {
        &self.inner.config
    }
}

impl<K, V> Clone for SharedSource<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for SharedSource<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len();
        f.debug_struct("SharedSource")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .finish_non_exhaustive()
    }
}

impl<K, V> SharedStream<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// The key this stream is bound to.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Attach a new subscriber.
    ///
    /// The subscriber first receives the replay buffer, then live values.
    /// Starts the producer if it is not running. Dropping the returned
    /// [`Subscription`] detaches it.
    pub fn subscribe(&self) -> Subscription<V> {
        self.inner.attach(&self.key)
    }

    /// Number of subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count(&self.key)
    }

    /// The most recent buffered value, if any.
    pub fn latest(&self) -> Option<V> {
        self.inner
            .lock()
            .entries
            .get(&self.key)
            .and_then(|entry| entry.buffer.back().cloned())
    }
}

impl<K: Clone, V> Clone for SharedStream<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: PartialEq, V> PartialEq for SharedStream<K, V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.key == other.key
    }
}

impl<K: fmt::Debug, V> fmt::Debug for SharedStream<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStream")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub(crate) fn box_builder<K, V, F, S>(builder: F) -> Arc<Builder<K, V>>
where
    F: Fn(&K) -> S + Send + Sync + 'static,
    S: Stream<Item = V> + Send + 'static,
{
    Arc::new(move |key: &K| builder(key).boxed())
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Registry<K, V>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriber_count(&self, key: &K) -> usize {
        self.lock()
            .entries
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    fn attach(self: &Arc<Self>, key: &K) -> Subscription<V> {
        let (sender, receiver) = mpsc::channel(self.config.queue_size());
        let mut guard = self.lock();
        let registry = &mut *guard;

        let entry = match registry.entries.entry(key.clone()) {
            hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            hash_map::Entry::Vacant(vacant) => {
                registry.next_entry += 1;
                vacant.insert(Entry::new(registry.next_entry, registry.seed.clone()))
            }
        };

        entry.cancel_timer();
        for value in &entry.buffer {
            let _ = sender.try_send(value.clone());
        }
        let subscriber = entry.next_subscriber;
        entry.next_subscriber += 1;
        entry.subscribers.insert(subscriber, sender);
        tracing::trace!(
            key = ?key,
            subscribers = entry.subscribers.len(),
            replayed = entry.buffer.len(),
            "subscriber attached"
        );

        if entry.producer.is_none() {
            self.start(key, entry);
        }

        let entry_id = entry.id;
        let inner = Arc::clone(self);
        let key = key.clone();
        Subscription::new(
            receiver,
            Box::new(move || inner.detach(&key, entry_id, subscriber)),
        )
    }

    fn detach(self: &Arc<Self>, key: &K, entry_id: u64, subscriber: u64) {
        let mut guard = self.lock();
        let registry = &mut *guard;
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        if entry.id != entry_id || entry.subscribers.remove(&subscriber).is_none() {
            return;
        }
        tracing::trace!(
            key = ?key,
            subscribers = entry.subscribers.len(),
            "subscriber detached"
        );

        if entry.subscribers.is_empty() {
            self.idle(registry, key);
        }
    }

    fn start(self: &Arc<Self>, key: &K, entry: &mut Entry<V>) {
        entry.runs += 1;
        let run = entry.runs;
        let entry_id = entry.id;
        let token = CancellationToken::new();
        entry.producer = Some(Running {
            run,
            token: token.clone(),
        });
        tracing::debug!(key = ?key, run, "starting shared producer");

        let weak = Arc::downgrade(self);
        let builder = Arc::clone(&self.builder);
        let key = key.clone();
        self.runtime.spawn(async move {
            let produce = {
                let key = key.clone();
                let weak = weak.clone();
                async move {
                    let mut stream = builder(&key);
                    loop {
                        let next = tokio::select! {
                            biased;
                            () = token.cancelled() => break,
                            next = stream.next() => next,
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let completed = next.is_none();
                        inner.deliver(&key, entry_id, run, next);
                        if completed {
                            break;
                        }
                    }
                }
            };

            // A panicking producer completes like one that ended.
            if AssertUnwindSafe(produce).catch_unwind().await.is_err() {
                tracing::error!(key = ?key, run, "shared producer panicked");
                if let Some(inner) = weak.upgrade() {
                    inner.deliver(&key, entry_id, run, None);
                }
            }
        });
    }

    /// Hand a producer item to the entry, or record the producer's completion.
    fn deliver(self: &Arc<Self>, key: &K, entry_id: u64, run: u64, next: Option<V>) {
        let mut guard = self.lock();
        let registry = &mut *guard;
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        if entry.id != entry_id || entry.running() != Some(run) {
            return;
        }

        match next {
            Some(value) => {
                if self.publish(key, entry, value) {
                    self.idle(registry, key);
                }
            }
            None => {
                tracing::debug!(key = ?key, run, "shared producer completed");
                entry.producer = None;
                entry.subscribers.clear();
                self.release(registry, key);
            }
        }
    }

    /// Buffer `value` and fan it out in attach order. A subscriber whose
    /// queue is full is detached. Returns true if that left the entry with
    /// no subscribers.
    fn publish(&self, key: &K, entry: &mut Entry<V>, value: V) -> bool {
        if let Some(same) = &self.conflate {
            if entry.buffer.back().is_some_and(|last| same(last, &value)) {
                return false;
            }
        }

        let replay = self.config.replay();
        if replay > 0 {
            entry.buffer.push_back(value.clone());
            while entry.buffer.len() > replay {
                entry.buffer.pop_front();
            }
        }

        let attached = entry.subscribers.len();
        entry
            .subscribers
            .retain(|subscriber, sender| match sender.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        key = ?key,
                        subscriber = *subscriber,
                        capacity = self.config.queue_size(),
                        "subscriber queue full, detaching"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        attached > 0 && entry.subscribers.is_empty()
    }

    /// The last subscriber left `key`.
    fn idle(self: &Arc<Self>, registry: &mut Registry<K, V>, key: &K) {
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        let timeout = self.config.stop_timeout();
        if entry.producer.is_some() && !timeout.is_zero() {
            self.arm(key, entry, timeout, Timer::Stop);
        } else {
            self.release(registry, key);
        }
    }

    /// Stop the producer of an unsubscribed entry and apply the replay policy.
    fn release(self: &Arc<Self>, registry: &mut Registry<K, V>, key: &K) {
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        if let Some(running) = entry.producer.take() {
            tracing::debug!(key = ?key, run = running.run, "stopping shared producer");
            running.token.cancel();
        }

        match self.config.replay_expiration() {
            Some(expiration) if !expiration.is_zero() && !entry.buffer.is_empty() => {
                self.arm(key, entry, expiration, Timer::Expire);
            }
            None if !entry.buffer.is_empty() => {
                entry.cancel_timer();
                tracing::trace!(key = ?key, "retaining replay buffer");
            }
            _ => {
                registry.entries.remove(key);
                tracing::trace!(key = ?key, "shared entry removed");
            }
        }
    }

    fn arm(self: &Arc<Self>, key: &K, entry: &mut Entry<V>, delay: Duration, timer: Timer) {
        entry.cancel_timer();
        let epoch = entry.epoch;
        let entry_id = entry.id;
        tracing::trace!(
            key = ?key,
            ?timer,
            delay_ms = delay.as_millis() as u64,
            "timer armed"
        );

        let weak = Arc::downgrade(self);
        let key = key.clone();
        entry.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(&key, entry_id, epoch, timer);
            }
        }));
    }

    fn fire(self: &Arc<Self>, key: &K, entry_id: u64, epoch: u64, timer: Timer) {
        let mut guard = self.lock();
        let registry = &mut *guard;
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        if entry.id != entry_id || entry.epoch != epoch || !entry.subscribers.is_empty() {
            return;
        }
        entry.timer = None;

        match timer {
            Timer::Stop => self.release(registry, key),
            Timer::Expire => {
                registry.entries.remove(key);
                tracing::trace!(key = ?key, "replay buffer expired");
            }
        }
    }
}

impl<V> Entry<V> {
    fn new(id: u64, seed: Option<V>) -> Self {
        Self {
            id,
            subscribers: BTreeMap::new(),
            next_subscriber: 0,
            buffer: seed.into_iter().collect(),
            producer: None,
            runs: 0,
            timer: None,
            epoch: 0,
        }
    }

    fn running(&self) -> Option<u64> {
        self.producer.as_ref().map(|running| running.run)
    }

    /// Disarm any pending timer; a timer that already fired sees a stale epoch.
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.epoch += 1;
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        if let Some(running) = self.producer.take() {
            running.token.cancel();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
