//! Lifecycle coordinator.
//!
//! [`Bus`] owns the store handle, the publisher, every subscription task and
//! the forwarder task. Tasks are tracked with a [`TaskTracker`] and stopped
//! through cancellation tokens, so shutdown can run its steps in a fixed
//! order:
//!
//! ```text
//! subscriptions ─┐
//! forwarder     ─┼─► wait for tasks (bounded) ─► close publisher ─► close store
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use opentelemetry::Context;
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    Message,
    config::BusConfig,
    error::{BusError, BusErrorKind},
    forwarder::Forwarder,
    handler::Handler,
    hook::{BusHook, DefaultBusHook},
    propagation::Propagation,
    publisher::Publisher,
    store::{EnqueueMessages, MessageStore},
    subscriber::{Delivery, DispatchSettings, Group, HandlerError, Subscription},
};

/// Durable publish/subscribe bus over a [`MessageStore`].
///
/// ```rust
/// use letterbox::{Bus, BusConfig, Delivery, Message, handler_fn, store::inmemory::InMemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = Bus::new(InMemoryStore::default(), BusConfig::default()).await?;
///
/// let _errors = bus.subscribe("items", handler_fn(|delivery: Delivery| async move {
///     println!("received {:?}", delivery.message().payload());
///     Ok::<_, std::convert::Infallible>(())
/// })).await?;
///
/// bus.publish("items", [Message::new("hello")]).await?;
/// bus.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Bus<S> {
    store: S,
    config: BusConfig,
    publisher: Publisher<S>,
    settings: DispatchSettings,
    tracker: TaskTracker,
    subscriptions: CancellationToken,
    forwarder: CancellationToken,
    forwarder_started: AtomicBool,
    shut_down: AtomicBool,
}

impl<S> Bus<S>
where
    S: MessageStore,
{
    /// Create a bus and make sure the store schema exists.
    #[tracing::instrument(skip_all)]
    pub async fn new(store: S, config: BusConfig) -> Result<Self, BusError> {
        store
            .initialize()
            .await
            .map_err(|e| BusError::store("initialize", None, e))?;

        let propagation = Propagation::global();
        let publisher = if config.forwarder_enabled {
            Publisher::outbox(store.clone(), config.forwarder_topic.as_str())
        } else {
            Publisher::direct(store.clone(), config.forwarder_topic.as_str())
        }
        .with_propagation(propagation.clone());

        let settings = DispatchSettings {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size.max(1),
            claim_lease: config.claim_lease,
            redelivery_delay: config.redelivery_delay,
            retry: config.retry,
            propagation,
            hook: Arc::new(DefaultBusHook),
        };

        Ok(Self {
            store,
            config,
            publisher,
            settings,
            tracker: TaskTracker::new(),
            subscriptions: CancellationToken::new(),
            forwarder: CancellationToken::new(),
            forwarder_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Replace the lifecycle hook. Affects subscriptions started afterwards.
    pub fn with_hook(mut self, hook: impl BusHook) -> Self {
        self.settings.hook = Arc::new(hook);
        self
    }

    /// Replace the trace context propagator used on both publish and
    /// subscribe.
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.publisher = self.publisher.with_propagation(propagation.clone());
        self.settings.propagation = propagation;
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &Publisher<S> {
        &self.publisher
    }

    /// See [`Publisher::publish`].
    pub async fn publish<I>(&self, topic: &str, messages: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        self.publisher.publish(topic, messages).await
    }

    /// See [`Publisher::publish_with_context`].
    pub async fn publish_with_context<I>(
        &self,
        cx: &Context,
        topic: &str,
        messages: I,
    ) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        self.publisher.publish_with_context(cx, topic, messages).await
    }

    /// See [`Publisher::publish_in_tx`].
    pub async fn publish_in_tx<I>(
        &self,
        tx: &mut <S as EnqueueMessages>::Transaction<'_>,
        topic: &str,
        messages: I,
    ) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        self.publisher.publish_in_tx(tx, topic, messages).await
    }

    /// Subscribe `handler` to `topic` with the configured default group.
    ///
    /// With no default group configured the subscription is a broadcast one.
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: Handler<H>,
    ) -> Result<mpsc::Receiver<HandlerError>, BusError>
    where
        H: tower::Service<Delivery, Response = ()> + Clone + Send + 'static,
        H::Error: Into<tower::BoxError>,
        H::Future: Send + 'static,
    {
        let group = Group::from(self.config.consumer_group.clone());
        self.subscribe_with(topic, group, handler).await
    }

    /// Subscribe `handler` to `topic` as a member of `group`.
    ///
    /// Returns the receiving end of the error channel. A message whose
    /// handler exhausted its retries is reported there; when the channel is
    /// full the error is dropped and logged instead.
    #[tracing::instrument(skip(self, handler))]
    pub async fn subscribe_with<H>(
        &self,
        topic: &str,
        group: Group,
        handler: Handler<H>,
    ) -> Result<mpsc::Receiver<HandlerError>, BusError>
    where
        H: tower::Service<Delivery, Response = ()> + Clone + Send + 'static,
        H::Error: Into<tower::BoxError>,
        H::Future: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(BusError::new(BusErrorKind::Closed));
        }
        if topic == self.config.forwarder_topic {
            return Err(BusError::new(BusErrorKind::ReservedTopic(topic.to_owned())));
        }

        let (group, after_offset, ephemeral) = match group {
            Group::Named(name) => (name, 0, false),
            Group::Broadcast => {
                let head = self
                    .store
                    .head(topic)
                    .await
                    .map_err(|e| BusError::store("subscribe", Some(topic), e))?;
                (format!("broadcast-{}", uuid::Uuid::new_v4()), head, true)
            }
        };

        let (errors, receiver) = mpsc::channel(self.config.error_channel_capacity.max(1));
        let subscription = Subscription {
            store: self.store.clone(),
            topic: Arc::from(topic),
            group,
            after_offset,
            ephemeral,
            handler,
            errors,
            settings: self.settings.clone(),
        };
        self.tracker
            .spawn(subscription.run(self.subscriptions.clone()));

        Ok(receiver)
    }

    /// Start the outbox forwarder.
    ///
    /// Returns once the forwarder is polling. The forwarder stops when
    /// `cancel` fires or the bus shuts down.
    #[tracing::instrument(skip_all)]
    pub async fn start_forwarder(&self, cancel: &CancellationToken) -> Result<(), BusError> {
        if !self.config.forwarder_enabled {
            return Err(BusError::new(BusErrorKind::NotConfiguredForForwarding));
        }
        if self.is_shut_down() {
            return Err(BusError::new(BusErrorKind::Closed));
        }
        if self.forwarder_started.swap(true, Ordering::SeqCst) {
            return Err(BusError::new(BusErrorKind::ForwarderAlreadyStarted));
        }

        let token = self.forwarder.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();

        let forwarder = Forwarder {
            store: self.store.clone(),
            topic: Arc::from(self.config.forwarder_topic.as_str()),
            group: self.config.forwarder_group.clone(),
            publisher: self.publisher.forwarding_path(),
            settings: self.settings.clone(),
        };
        self.tracker.spawn(forwarder.run(token.clone(), ready_tx));

        let caller = cancel.clone();
        let linked = token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BusError::cancelled("start_forwarder")),
            ready = ready_rx => ready.map_err(|_| BusError::cancelled("start_forwarder")),
        }
    }

    /// Probe the store.
    pub async fn ping(&self) -> Result<(), BusError> {
        self.store
            .ping()
            .await
            .map_err(|e| BusError::store("ping", None, e))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop everything in order: subscriptions, forwarder, in-flight tasks
    /// (bounded by `shutdown_timeout`), publisher, store.
    ///
    /// Every step runs even if an earlier one failed. A second call is a
    /// no-op.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();

        self.subscriptions.cancel();
        self.forwarder.cancel();

        self.tracker.close();
        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            self.settings.hook.on_shutdown_timeout(timeout);
        }

        self.publisher.close();

        if let Err(err) = self.store.close().await {
            errors.push(BusError::store("close", None, err));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError(errors))
        }
    }
}

/// Errors collected while shutting down.
#[derive(Debug)]
pub struct ShutdownError(pub Vec<BusError>);

impl ShutdownError {
    pub fn errors(&self) -> &[BusError] {
        &self.0
    }
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Shutdown failed with {} error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "  {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.first().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
