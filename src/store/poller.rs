use std::time::Duration;

use futures_core::stream::BoxStream;
use tokio::{sync::oneshot, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Builder for a polling stream.
///
/// Configures the polling interval and an optional readiness signal.
pub struct PollerBuilder {
    interval: Duration,
    ready: Option<oneshot::Sender<()>>,
}

impl PollerBuilder {
    /// Create a new `PollerBuilder` with the specified polling interval.
    ///
    /// # Arguments
    ///
    /// * `interval` - Wait between polls that return nothing.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ready: None,
        }
    }

    /// Signal `ready` once the stream starts polling.
    pub fn notify_ready(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Turn `poll_fn` into a stream of items.
    ///
    /// Nothing runs until the stream is polled. After a non-empty batch the
    /// next batch is fetched right away; an empty batch or an error waits
    /// for the next tick. Each error is yielded as `Err(BoxError)`.
    ///
    /// The stream ends when `cancel` fires. Items of a batch that were
    /// already fetched are still yielded, but no further batch is fetched.
    pub fn stream<T, F, Fut>(
        self,
        cancel: CancellationToken,
        mut poll_fn: F,
    ) -> BoxStream<'static, Result<T, tower::BoxError>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<T>, tower::BoxError>> + Send,
    {
        let Self { interval, ready } = self;

        Box::pin(async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            if let Some(ready) = ready {
                let _ = ready.send(());
            }

            'poll: loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'poll,
                    _ = ticker.tick() => {}
                }

                loop {
                    if cancel.is_cancelled() {
                        break 'poll;
                    }
                    match poll_fn().await {
                        Ok(items) if items.is_empty() => break,
                        Ok(items) => {
                            for item in items {
                                yield Ok(item);
                            }
                        }
                        Err(err) => {
                            yield Err(err);
                            break;
                        }
                    }
                }
            }
        })
    }
}
