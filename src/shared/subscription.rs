//! Subscriber side of a shared stream.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// One subscriber attached to a shared stream.
///
/// Yields the replayed values followed by live values, and ends when the
/// producer completes or the source is cleared. A subscriber that lets more
/// than [`capacity`](crate::SharingConfig::capacity) values pile up is
/// detached; it still yields the queued values, then ends. Dropping the subscription
/// detaches it; when it was the last subscriber the producer is stopped
/// according to the source's [`SharingConfig`](crate::SharingConfig).
pub struct Subscription<V> {
    receiver: mpsc::Receiver<V>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl<V> Subscription<V> {
    pub(crate) fn new(receiver: mpsc::Receiver<V>, detach: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            receiver,
            detach: Some(detach),
        }
    }

    /// Detach now. Same as dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<V> Stream for Subscription<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<V>> {
        self.receiver.poll_recv(cx)
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl<V> fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish_non_exhaustive()
    }
}
