use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::time::{sleep, timeout, Instant};

use super::*;
use crate::testing::LiveCounter;
use crate::{RetryBackoff, RetryError, RetryPolicy};

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Yields 0, 1, 2, ... one per second, the first after one second.
fn every_second() -> impl Stream<Item = u32> + Send + 'static {
    futures::stream::unfold(0u32, |n| async move {
        sleep(millis(1000)).await;
        Some((n, n + 1))
    })
}

fn counted(
    counter: &LiveCounter,
    config: SharingConfig,
) -> SharedSource<String, u32> {
    let counter = counter.clone();
    SharedSource::new(config, move |_: &String| counter.track(every_second()))
}

async fn next_now<S: Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    timeout(millis(1), stream.next()).await.ok().flatten()
}

#[tokio::test(start_paused = true)]
async fn test_builder_creates_the_producer() {
    let source = SharedSource::new(SharingConfig::new(), |key: &String| {
        let key = key.clone();
        futures::stream::iter(1..=3).then(move |n| {
            let value = format!("{}{}", n, key);
            async move {
                sleep(millis(1000)).await;
                value
            }
        })
    });

    let start = Instant::now();
    let received: Vec<(u128, String)> = source
        .get("ABC".to_string())
        .subscribe()
        .map(|value| (start.elapsed().as_millis(), value))
        .take(3)
        .collect()
        .await;

    assert_eq!(
        received,
        vec![
            (1000, "1ABC".to_string()),
            (2000, "2ABC".to_string()),
            (3000, "3ABC".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_same_key_shares_one_producer() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let source = SharedSource::new(SharingConfig::new(), move |_: &String| {
        counter.fetch_add(1, Ordering::SeqCst);
        every_second()
    });

    let _subscriptions: Vec<_> = ["A", "A", "B", "A", "B", "C"]
        .into_iter()
        .map(|key| source.get(key.to_string()).subscribe())
        .collect();

    sleep(millis(4000)).await;

    assert_eq!(built.load(Ordering::SeqCst), 3);
    assert_eq!(source.subscriber_count(&"A".to_string()), 3);
    assert_eq!(source.subscriber_count(&"B".to_string()), 2);
    assert_eq!(source.subscriber_count(&"C".to_string()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_of_one_key_see_the_same_values() {
    let counter = LiveCounter::new();
    let source = counted(&counter, SharingConfig::new());
    let stream = source.get("A".to_string());

    let mut first = stream.subscribe();
    let mut second = stream.subscribe();

    assert_eq!(first.next().await, Some(0));
    assert_eq!(second.next().await, Some(0));
    assert_eq!(first.next().await, Some(1));
    assert_eq!(second.next().await, Some(1));
    assert_eq!(counter.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_producer_stops_when_last_subscriber_leaves() {
    let counter = LiveCounter::new();
    let source = counted(&counter, SharingConfig::new());

    let a1 = source.get("A".to_string()).subscribe();
    let a2 = source.get("A".to_string()).subscribe();
    let b1 = source.get("B".to_string()).subscribe();
    let b2 = source.get("B".to_string()).subscribe();
    let c1 = source.get("C".to_string()).subscribe();

    sleep(millis(3000)).await;
    assert_eq!(counter.live(), 3);

    drop(b2);
    drop(c1);
    sleep(millis(1)).await;
    assert_eq!(counter.live(), 2);

    drop(a2);
    drop(b1);
    sleep(millis(1)).await;
    assert_eq!(counter.live(), 1);

    a1.unsubscribe();
    sleep(millis(1)).await;
    assert_eq!(counter.live(), 0);
    assert_eq!(counter.started(), 3);
    assert!(!source.contains(&"A".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_new_subscriber_receives_last_value() {
    let counter = LiveCounter::new();
    let source = counted(
        &counter,
        SharingConfig::new()
            .with_replay(1)
            .with_replay_expiration(millis(1000)),
    );

    let _first = source.get("A".to_string()).subscribe();
    sleep(millis(10500)).await;

    let mut late = source.get("A".to_string()).subscribe();
    assert_eq!(next_now(&mut late).await, Some(9));
    assert_eq!(counter.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replay_is_bounded_to_the_most_recent_values() {
    let counter = LiveCounter::new();
    let source = counted(&counter, SharingConfig::new().with_replay(3));

    let _first = source.get("A".to_string()).subscribe();
    sleep(millis(5500)).await;

    let late: Vec<u32> = source
        .get("A".to_string())
        .subscribe()
        .take(4)
        .collect()
        .await;
    assert_eq!(late, vec![2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_replay_survives_within_expiration() {
    let counter = LiveCounter::new();
    let source = counted(
        &counter,
        SharingConfig::new()
            .with_replay(1)
            .with_replay_expiration(millis(5000)),
    );

    let first = source.get("A".to_string()).subscribe();
    sleep(millis(10500)).await;
    drop(first);

    sleep(millis(1)).await;
    assert_eq!(counter.live(), 0);

    sleep(millis(4998)).await;
    assert!(source.contains(&"A".to_string()));

    let mut late = source.get("A".to_string()).subscribe();
    assert_eq!(next_now(&mut late).await, Some(9));
    assert_eq!(counter.started(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_replay_is_dropped_after_expiration() {
    let counter = LiveCounter::new();
    let source = counted(
        &counter,
        SharingConfig::new()
            .with_replay(1)
            .with_replay_expiration(millis(5000)),
    );

    let first = source.get("A".to_string()).subscribe();
    sleep(millis(10500)).await;
    drop(first);

    sleep(millis(5001)).await;
    assert!(!source.contains(&"A".to_string()));

    let mut late = source.get("A".to_string()).subscribe();
    assert_eq!(next_now(&mut late).await, None);
    assert_eq!(late.next().await, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_replay_without_expiration_is_retained() {
    let counter = LiveCounter::new();
    let source = counted(&counter, SharingConfig::new().with_replay(1));

    let first = source.get("A".to_string()).subscribe();
    sleep(millis(2500)).await;
    drop(first);

    sleep(millis(3_600_000)).await;
    assert!(source.contains(&"A".to_string()));
    assert_eq!(source.get("A".to_string()).latest(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_zero_expiration_discards_replay_immediately() {
    let counter = LiveCounter::new();
    let source = counted(
        &counter,
        SharingConfig::new()
            .with_replay(1)
            .with_replay_expiration(Duration::ZERO),
    );

    let first = source.get("A".to_string()).subscribe();
    sleep(millis(2500)).await;
    drop(first);

    assert!(!source.contains(&"A".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_timeout_keeps_producer_for_returning_subscriber() {
    let counter = LiveCounter::new();
    let source = counted(
        &counter,
        SharingConfig::new().with_stop_timeout(millis(2000)),
    );

    let first = source.get("A".to_string()).subscribe();
    sleep(millis(3500)).await;
    drop(first);

    sleep(millis(1000)).await;
    assert_eq!(counter.live(), 1);

    let mut returning = source.get("A".to_string()).subscribe();
    assert_eq!(returning.next().await, Some(4));
    assert_eq!(counter.started(), 1);

    drop(returning);
    sleep(millis(1999)).await;
    assert_eq!(counter.live(), 1);

    sleep(millis(2)).await;
    assert_eq!(counter.live(), 0);
    assert!(!source.contains(&"A".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_completed_producer_ends_subscriptions_and_restarts() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let source = SharedSource::new(SharingConfig::new(), move |_: &String| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::stream::iter(vec![1, 2])
    });

    let first: Vec<i32> = source.get("A".to_string()).subscribe().collect().await;
    assert_eq!(first, vec![1, 2]);
    assert!(!source.contains(&"A".to_string()));

    let second: Vec<i32> = source.get("A".to_string()).subscribe().collect().await;
    assert_eq!(second, vec![1, 2]);
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

struct Observed {
    inner: BoxStream<'static, u32>,
    label: String,
    events: Arc<Mutex<Vec<String>>>,
}

impl Stream for Observed {
    type Item = u32;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<u32>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Observed {
    fn drop(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} completed", self.label));
    }
}

fn observe(
    events: &Arc<Mutex<Vec<String>>>,
    label: String,
    inner: BoxStream<'static, u32>,
) -> Observed {
    events.lock().unwrap().push(format!("{} started", label));
    Observed {
        inner,
        label,
        events: Arc::clone(events),
    }
}

#[tokio::test(start_paused = true)]
async fn test_nested_sources_start_and_stop_in_order() {
    let events = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&events);
    let inner_source = SharedSource::new(SharingConfig::new(), move |key: &String| {
        observe(&log, format!("inner {}", key), every_second().boxed())
    });

    let log = Arc::clone(&events);
    let outer_source = SharedSource::new(SharingConfig::new(), move |key: &String| {
        let upstream = inner_source.get("A".to_string()).subscribe().boxed();
        observe(&log, format!("outer {}", key), upstream)
    });

    events.lock().unwrap().push("subscriber started".to_string());
    let subscription = outer_source.get("A".to_string()).subscribe();
    sleep(millis(1)).await;

    assert_eq!(
        std::mem::take(&mut *events.lock().unwrap()),
        vec!["subscriber started", "outer A started", "inner A started"]
    );

    drop(subscription);
    events.lock().unwrap().push("subscriber completed".to_string());
    sleep(millis(1)).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["subscriber completed", "outer A completed", "inner A completed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_clear_ends_subscriptions_and_stops_producers() {
    let counter = LiveCounter::new();
    let source = counted(&counter, SharingConfig::new().with_replay(1));

    let mut a = source.get("A".to_string()).subscribe();
    let mut b = source.get("B".to_string()).subscribe();
    sleep(millis(1500)).await;

    source.clear();
    sleep(millis(1)).await;

    assert!(source.all().is_empty());
    assert_eq!(counter.live(), 0);
    assert_eq!(a.next().await, Some(0));
    assert_eq!(a.next().await, None);
    assert_eq!(b.next().await, Some(0));
    assert_eq!(b.next().await, None);

    drop(a);
    let mut fresh = source.get("A".to_string()).subscribe();
    assert_eq!(fresh.next().await, Some(0));
    assert_eq!(counter.started(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_all_lists_active_streams() {
    let counter = LiveCounter::new();
    let source = counted(&counter, SharingConfig::new());

    let a = source.get("A".to_string()).subscribe();
    let b = source.get("B".to_string()).subscribe();

    let mut keys: Vec<String> = source.all().iter().map(|s| s.key().clone()).collect();
    keys.sort();
    assert_eq!(keys, vec!["A", "B"]);

    drop(a);
    drop(b);
    assert!(source.all().is_empty());
}

#[tokio::test]
async fn test_streams_compare_by_source_and_key() {
    let source = SharedSource::new(SharingConfig::new(), |_: &String| futures::stream::empty::<u32>());
    let other = SharedSource::new(SharingConfig::new(), |_: &String| futures::stream::empty::<u32>());

    assert_eq!(source.get("A".to_string()), source.get("A".to_string()));
    assert_eq!(source.get("A".to_string()), source.clone().get("A".to_string()));
    assert_ne!(source.get("A".to_string()), source.get("B".to_string()));
    assert_ne!(source.get("A".to_string()), other.get("A".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_state_source_conflates_and_keeps_current_value() {
    let source = StateSource::new(0, SharingConfig::new(), |_: &String| {
        futures::stream::iter(vec![1, 1, 2, 2, 3])
            .then(|n| async move {
                sleep(millis(1000)).await;
                n
            })
            .chain(futures::stream::pending())
    });
    let state = source.get("A".to_string());
    assert_eq!(state.value(), 0);

    let mut subscription = state.subscribe();
    let seen: Vec<i32> = subscription.by_ref().take(4).collect().await;
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_eq!(state.value(), 3);

    let mut late = state.subscribe();
    assert_eq!(next_now(&mut late).await, Some(3));

    drop(subscription);
    drop(late);
    assert_eq!(state.value(), 3);

    source.clear();
    assert_eq!(state.value(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retried_producer_recovers_for_subscribers() {
    let connects = Arc::new(AtomicUsize::new(0));
    let backoff = RetryBackoff::<String>::new(RetryPolicy::new(millis(1000)).with_jitter(0.0))
        .unwrap();

    let counter = Arc::clone(&connects);
    let source = SharedSource::new(SharingConfig::new(), move |_: &String| {
        let counter = Arc::clone(&counter);
        backoff.stream(move || {
            let connect = counter.fetch_add(1, Ordering::SeqCst);
            let items = if connect == 0 {
                vec![Ok(1), Err("connection reset".to_string())]
            } else {
                vec![Ok(2), Ok(3)]
            };
            futures::stream::iter(items)
        })
    });

    let start = Instant::now();
    let received: Vec<Result<i32, RetryError<String>>> =
        source.get("feed".to_string()).subscribe().collect().await;

    assert_eq!(received, vec![Ok(1), Ok(2), Ok(3)]);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(start.elapsed(), millis(1000));
}

/// Yields 0, 1, 2, ... one per millisecond.
fn every_millisecond() -> impl Stream<Item = u32> + Send + 'static {
    futures::stream::unfold(0u32, |n| async move {
        sleep(millis(1)).await;
        Some((n, n + 1))
    })
}

#[tokio::test(start_paused = true)]
async fn test_stalled_subscriber_is_detached_when_queue_fills() {
    let counter = LiveCounter::new();
    let source = {
        let counter = counter.clone();
        SharedSource::new(SharingConfig::new().with_capacity(8), move |_: &String| {
            counter.track(every_millisecond())
        })
    };
    let key = "A".to_string();

    let stalled = source.get(key.clone()).subscribe();
    let mut active = source.get(key.clone()).subscribe();
    let reader = tokio::spawn(async move {
        let mut last = None;
        for _ in 0..100 {
            last = active.next().await;
        }
        last
    });

    assert_eq!(reader.await.unwrap(), Some(99));
    sleep(millis(1)).await;

    assert_eq!(source.subscriber_count(&key), 0);
    assert_eq!(counter.live(), 0);
    let queued: Vec<u32> = stalled.collect().await;
    assert_eq!(queued, (0..8).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_values_reach_subscribers_in_attach_order() {
    let source = SharedSource::new(SharingConfig::new(), |_: &String| every_second());
    let received = Arc::new(Mutex::new(Vec::new()));

    let subscriptions: Vec<_> = (0..8)
        .map(|id| (id, source.get("A".to_string()).subscribe()))
        .collect();
    let readers: Vec<_> = subscriptions
        .into_iter()
        .rev()
        .map(|(id, mut subscription)| {
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                subscription.next().await;
                received.lock().unwrap().push(id);
            })
        })
        .collect();

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(*received.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_producer_ends_subscriptions() {
    let counter = LiveCounter::new();
    let source = {
        let counter = counter.clone();
        SharedSource::new(SharingConfig::new(), move |_: &String| {
            counter.track(futures::stream::iter(1..=3).map(|n| {
                if n == 3 {
                    panic!("feed crashed");
                }
                n
            }))
        })
    };

    let subscription = source.get("A".to_string()).subscribe();
    let received = timeout(millis(1000), subscription.collect::<Vec<_>>()).await;
    assert_eq!(received, Ok(vec![1, 2]));
    assert_eq!(counter.live(), 0);
    assert!(!source.contains(&"A".to_string()));

    let retry = source.get("A".to_string()).subscribe();
    let received = timeout(millis(1000), retry.collect::<Vec<_>>()).await;
    assert_eq!(received, Ok(vec![1, 2]));
    assert_eq!(counter.started(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attach_and_detach_leave_nothing_behind() {
    let counter = LiveCounter::new();
    let source = {
        let counter = counter.clone();
        SharedSource::new(SharingConfig::new(), move |_: &String| {
            counter.track(futures::stream::pending::<u32>())
        })
    };
    let key = "A".to_string();

    let workers: Vec<_> = (0..64)
        .map(|_| {
            let stream = source.get(key.clone());
            tokio::spawn(async move {
                for _ in 0..200 {
                    let subscription = stream.subscribe();
                    tokio::task::yield_now().await;
                    drop(subscription);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    for _ in 0..200 {
        if counter.live() == 0 {
            break;
        }
        sleep(millis(10)).await;
    }

    assert_eq!(counter.live(), 0);
    assert!(counter.started() >= 1);
    assert_eq!(source.subscriber_count(&key), 0);
    assert!(!source.contains(&key));
}
