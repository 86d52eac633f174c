//! Subscription dispatch loop.
//!
//! Each subscription runs as one task:
//!
//! 1. claim the next message for `(topic, group)` from a lazy claim stream
//! 2. restore the publisher's trace context and open a `letterbox.handle` span
//! 3. run the handler under the bus retry policy
//! 4. ack on success; on failure nack and report a [`HandlerError`]
//!
//! Cancellation stops claiming. A handler that is already running is never
//! aborted; its retry backoff is. Claims that were fetched but not handed
//! out yet are released for immediate redelivery.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use opentelemetry::Context;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;
use uuid::Uuid;

use crate::{
    Message,
    handler::Handler,
    hook::BusHook,
    propagation::Propagation,
    retry::{RetryError, RetryPolicy, retry_with_backoff},
    store::{self, ClaimMessages, ClaimRequest, Claimed, poller::PollerBuilder},
};

/// Consumer group of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    /// Load-balanced: each message goes to exactly one subscriber of the group.
    Named(String),
    /// Every broadcast subscriber sees every message published after it
    /// subscribed.
    Broadcast,
}

impl Group {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl From<Option<String>> for Group {
    fn from(value: Option<String>) -> Self {
        value.map_or(Self::Broadcast, Self::Named)
    }
}

/// A message handed to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    topic: Arc<str>,
    message: Arc<Message>,
    attempt: u32,
    delivery_count: u32,
    published_at: DateTime<Utc>,
    context: Context,
    cancel: CancellationToken,
}

impl Delivery {
    /// A delivery that is not backed by a claim, for exercising handlers in
    /// isolation.
    pub fn detached(topic: impl Into<Arc<str>>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            message: Arc::new(message),
            attempt: 1,
            delivery_count: 1,
            published_at: Utc::now(),
            context: Context::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Handler attempt within the current claim, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// How many times the message has been claimed by this group.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Trace context extracted from the message metadata.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Fires when the bus is shutting down. Long handlers may observe it to
    /// finish early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Error reported on the subscription error channel when a message
/// exhausted its retries.
#[derive(Debug)]
pub struct HandlerError {
    topic: String,
    message_id: Uuid,
    source: RetryError,
}

impl HandlerError {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Number of handler invocations before giving up.
    pub fn attempts(&self) -> u32 {
        self.source.attempts()
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Handler for message {} on {} failed: {}",
            self.message_id, self.topic, self.source
        )
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Settings shared by every subscription of a bus.
#[derive(Clone)]
pub(crate) struct DispatchSettings {
    pub(crate) poll_interval: Duration,
    pub(crate) batch_size: usize,
    pub(crate) claim_lease: Duration,
    pub(crate) redelivery_delay: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) propagation: Propagation,
    pub(crate) hook: Arc<dyn BusHook>,
}

/// One running subscription.
pub(crate) struct Subscription<S, H> {
    pub(crate) store: S,
    pub(crate) topic: Arc<str>,
    pub(crate) group: String,
    pub(crate) after_offset: i64,
    /// Private broadcast group whose delivery state is dropped when the
    /// subscription ends.
    pub(crate) ephemeral: bool,
    pub(crate) handler: Handler<H>,
    pub(crate) errors: mpsc::Sender<HandlerError>,
    pub(crate) settings: DispatchSettings,
}

impl<S, H> Subscription<S, H>
where
    S: ClaimMessages + Clone + Send + Sync + 'static,
    H: tower::Service<Delivery, Response = ()> + Clone + Send + 'static,
    H::Error: Into<tower::BoxError>,
    H::Future: Send + 'static,
{
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let hook = self.settings.hook.clone();
        hook.on_subscribe(&self.topic, &self.group);

        let request = ClaimRequest {
            topic: self.topic.to_string(),
            group: self.group.clone(),
            after_offset: self.after_offset,
            limit: self.settings.batch_size,
            lease: self.settings.claim_lease,
        };
        let mut claims = store::dequeue(
            self.store.clone(),
            request,
            PollerBuilder::new(self.settings.poll_interval),
            cancel.clone(),
        );

        loop {
            let claimed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = claims.next() => match next {
                    Some(Ok(claimed)) => claimed,
                    Some(Err(err)) => {
                        hook.on_claim_error(&self.topic, err.as_ref());
                        continue;
                    }
                    None => break,
                },
            };

            self.dispatch(claimed, &cancel).await;
        }

        // Releases claims that were fetched but never handed out.
        while claims.next().await.is_some() {}

        if self.ephemeral {
            if let Err(err) = self.store.forget_group(&self.topic, &self.group).await {
                tracing::warn!(
                    topic = %self.topic,
                    group = %self.group,
                    error = %err,
                    "Failed to drop broadcast group state"
                );
            }
        }

        hook.on_subscription_end(&self.topic, &self.group);
    }

    async fn dispatch(&mut self, claimed: Claimed, cancel: &CancellationToken) {
        let Claimed {
            receipt,
            message,
            published_at,
            delivery_count,
        } = claimed;
        let message_id = message.uuid();
        let settings = &self.settings;

        let parent = settings.propagation.extract(message.metadata());
        let span = tracing::info_span!(
            "letterbox.handle",
            topic = %self.topic,
            group = %self.group,
            %message_id,
            delivery_count
        );
        span.set_parent(parent.clone());

        let delivery = Delivery {
            topic: self.topic.clone(),
            message: Arc::new(message),
            attempt: 1,
            delivery_count,
            published_at,
            context: parent,
            cancel: cancel.clone(),
        };
        let handler = self.handler.clone();
        let topic = &self.topic;

        let result = retry_with_backoff(
            &settings.retry,
            cancel,
            move |attempt| {
                let handler = handler.clone();
                let mut delivery = delivery.clone();
                delivery.attempt = attempt;
                async move { handler.handle(delivery).await }
            },
            |attempt, delay, error| {
                settings
                    .hook
                    .on_handler_retry(topic, message_id, attempt, delay, error.as_ref())
            },
        )
        .instrument(span)
        .await;

        match result {
            Ok(attempts) => match self.store.ack(&receipt).await {
                Ok(()) => settings.hook.on_message_acked(topic, message_id, attempts),
                Err(err) => settings.hook.on_receipt_error(topic, message_id, &err),
            },
            Err(err) => {
                settings.hook.on_message_nacked(topic, message_id, &err);
                if let Err(nack_err) = self.store.nack(&receipt, settings.redelivery_delay).await {
                    settings.hook.on_receipt_error(topic, message_id, &nack_err);
                }
                if err.is_cancelled() {
                    return;
                }
                let error = HandlerError {
                    topic: topic.to_string(),
                    message_id,
                    source: err,
                };
                if self.errors.try_send(error).is_err() {
                    settings.hook.on_error_dropped(topic, message_id);
                }
            }
        }
    }
}
