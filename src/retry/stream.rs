//! Streaming retry: re-subscribes to a failing producer.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use super::backoff::RetryBackoff;
use super::error::RetryError;

/// Per-session attempt state for a retried stream.
///
/// Lives for as long as the derived stream; the failed inner stream is
/// dropped before the retry delay starts.
pub(crate) struct RetrySession<E, F, S> {
    backoff: RetryBackoff<E>,
    factory: F,
    current: Option<Pin<Box<S>>>,
    attempts_in_row: u32,
    total_attempts: u32,
    retrying: bool,
    /// Set on the first poll.
    started: Option<Instant>,
    finished: bool,
}

impl<V, E, F, S> RetrySession<E, F, S>
where
    F: FnMut() -> S,
    S: Stream<Item = Result<V, E>>,
{
    pub(crate) fn new(backoff: RetryBackoff<E>, factory: F) -> Self {
        Self {
            backoff,
            factory,
            current: None,
            attempts_in_row: 0,
            total_attempts: 0,
            retrying: false,
            started: None,
            finished: false,
        }
    }

    pub(crate) fn into_stream(self) -> impl Stream<Item = Result<V, RetryError<E>>> {
        futures::stream::unfold(self, |mut session| async move {
            let item = session.next_item().await?;
            Some((item, session))
        })
    }

    async fn next_item(&mut self) -> Option<Result<V, RetryError<E>>> {
        if self.finished {
            return None;
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        loop {
            let factory = &mut self.factory;
            let stream = self.current.get_or_insert_with(|| Box::pin(factory()));

            let polled = self.backoff.guarded(stream.next()).await;
            let Some(next) = polled else {
                return self.finish(RetryError::Cancelled { cause: None });
            };

            let error = match next {
                Some(Ok(value)) => {
                    self.on_emit();
                    return Some(Ok(value));
                }
                Some(Err(error)) => error,
                None => {
                    self.finished = true;
                    return None;
                }
            };

            self.current = None;
            self.retrying = true;
            let attempts = if self.backoff.policy().transient() {
                self.attempts_in_row
            } else {
                self.total_attempts
            };

            let delay = match self.backoff.on_failure(
                error,
                attempts,
                self.total_attempts,
                started,
                &mut Vec::new(),
            ) {
                Ok(delay) => delay,
                Err(terminal) => return self.finish(terminal),
            };

            if !self.backoff.sleep(delay).await {
                return self.finish(RetryError::Cancelled { cause: None });
            }
            self.attempts_in_row += 1;
            self.total_attempts += 1;
        }
    }

    fn on_emit(&mut self) {
        if self.retrying {
            self.retrying = false;
            self.backoff.on_recovered(self.attempts_in_row);
        }
        if self.backoff.policy().transient() {
            self.attempts_in_row = 0;
        }
    }

    fn finish(&mut self, error: RetryError<E>) -> Option<Result<V, RetryError<E>>> {
        self.finished = true;
        self.current = None;
        Some(Err(error))
    }
}
