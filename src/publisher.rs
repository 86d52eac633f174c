//! Publishing messages, directly or through the outbox.
//!
//! Every publish stamps the caller's trace context into the message
//! metadata before the message is stored. In outbox mode the message is
//! wrapped in an [`OutboxEnvelope`] and stored on the reserved forwarder
//! topic instead; the forwarder moves it to its real topic later.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use opentelemetry::Context;

use crate::{
    Message,
    error::{BusError, BusErrorKind},
    forwarder::OutboxEnvelope,
    propagation::{Propagation, current_context},
    store::EnqueueMessages,
};

/// Stores messages for a topic, either on the topic itself or wrapped in an
/// outbox envelope on the reserved forwarder topic.
///
/// Publishing on the reserved topic is rejected, and so is every publish
/// after [`close`](Self::close).
#[derive(Clone)]
pub struct Publisher<S> {
    store: S,
    propagation: Propagation,
    reserved_topic: Arc<str>,
    outbox: bool,
    closed: Arc<AtomicBool>,
}

impl<S> Publisher<S>
where
    S: EnqueueMessages + Send + Sync,
{
    /// Publisher that stores messages on their topic directly.
    pub fn direct(store: S, reserved_topic: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            propagation: Propagation::global(),
            reserved_topic: reserved_topic.into(),
            outbox: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publisher that wraps every message in an outbox envelope.
    pub fn outbox(store: S, reserved_topic: impl Into<Arc<str>>) -> Self {
        Self {
            outbox: true,
            ..Self::direct(store, reserved_topic)
        }
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn is_outbox(&self) -> bool {
        self.outbox
    }

    /// Direct path used by the forwarder. Shares the closed flag.
    pub(crate) fn forwarding_path(&self) -> Self
    where
        S: Clone,
    {
        Self {
            store: self.store.clone(),
            propagation: self.propagation.clone(),
            reserved_topic: self.reserved_topic.clone(),
            outbox: false,
            closed: self.closed.clone(),
        }
    }

    /// Publish `messages` on `topic` with the trace context of the current span.
    #[tracing::instrument(skip(self, messages))]
    pub async fn publish<I>(&self, topic: &str, messages: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        let messages: Vec<Message> = messages.into_iter().collect();
        self.publish_with_context(&current_context(), topic, messages)
            .await
    }

    /// Publish with an explicit trace context.
    pub async fn publish_with_context<I>(
        &self,
        cx: &Context,
        topic: &str,
        messages: I,
    ) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        let Some((target, messages)) = self.prepare(cx, topic, messages)? else {
            return Ok(());
        };

        self.store
            .enqueue(&target, messages)
            .await
            .map_err(|e| BusError::store("publish", Some(topic), e))
    }

    /// Publish inside the caller's transaction.
    ///
    /// The messages become visible only if the transaction commits.
    #[tracing::instrument(skip(self, tx, messages))]
    pub async fn publish_in_tx<I>(
        &self,
        tx: &mut S::Transaction<'_>,
        topic: &str,
        messages: I,
    ) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        let messages: Vec<Message> = messages.into_iter().collect();
        self.publish_in_tx_with_context(&current_context(), tx, topic, messages)
            .await
    }

    pub async fn publish_in_tx_with_context<I>(
        &self,
        cx: &Context,
        tx: &mut S::Transaction<'_>,
        topic: &str,
        messages: I,
    ) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        let Some((target, messages)) = self.prepare(cx, topic, messages)? else {
            return Ok(());
        };

        self.store
            .enqueue_in_tx(&target, messages, tx)
            .await
            .map_err(|e| BusError::store("publish", Some(topic), e))
    }

    /// Forward an already stamped message without re-injecting trace context.
    pub(crate) async fn forward(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.ensure_open()?;
        self.store
            .enqueue(topic, vec![message])
            .await
            .map_err(|e| BusError::store("forward", Some(topic), e))
    }

    /// Make every later publish fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::new(BusErrorKind::Closed));
        }
        Ok(())
    }

    /// Validate the topic, stamp trace context and wrap for the outbox.
    ///
    /// Returns `None` when there is nothing to publish.
    fn prepare<I>(
        &self,
        cx: &Context,
        topic: &str,
        messages: I,
    ) -> Result<Option<(String, Vec<Message>)>, BusError>
    where
        I: IntoIterator<Item = Message>,
    {
        self.ensure_open()?;
        if topic == &*self.reserved_topic {
            return Err(BusError::new(BusErrorKind::ReservedTopic(topic.to_owned())));
        }

        let mut messages: Vec<Message> = messages.into_iter().collect();
        if messages.is_empty() {
            return Ok(None);
        }

        for message in &mut messages {
            self.propagation.inject(cx, message.metadata_mut());
        }

        if !self.outbox {
            return Ok(Some((topic.to_owned(), messages)));
        }

        let envelopes = messages
            .into_iter()
            .map(|message| OutboxEnvelope::new(topic, message).into_message())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BusError::serde("publish", topic, e))?;

        Ok(Some((self.reserved_topic.to_string(), envelopes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClaimMessages, ClaimRequest, StoreLifecycle, inmemory::InMemoryStore};
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use std::time::Duration;

    const RESERVED: &str = "_forwarder_queue";

    async fn claim_all(store: &InMemoryStore, topic: &str) -> Vec<Message> {
        store
            .claim(&ClaimRequest {
                topic: topic.into(),
                group: "test".into(),
                after_offset: 0,
                limit: 100,
                lease: Duration::from_secs(30),
            })
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.message)
            .collect()
    }

    fn traced() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[tokio::test]
    async fn direct_publish_stores_on_the_topic_with_trace_context() {
        let store = InMemoryStore::default();
        let publisher = Publisher::direct(store.clone(), RESERVED)
            .with_propagation(Propagation::new(TraceContextPropagator::new()));

        publisher
            .publish_with_context(&traced(), "items", [Message::new("a")])
            .await
            .unwrap();

        let stored = claim_all(&store, "items").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].metadata().get("traceparent"),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
    }

    #[tokio::test]
    async fn outbox_publish_wraps_messages_in_envelopes() {
        let store = InMemoryStore::default();
        let publisher = Publisher::outbox(store.clone(), RESERVED);
        let message = Message::new("a");

        publisher
            .publish("items", [message.clone()])
            .await
            .unwrap();

        assert!(claim_all(&store, "items").await.is_empty());
        let envelopes = claim_all(&store, RESERVED).await;
        assert_eq!(envelopes.len(), 1);

        let envelope = OutboxEnvelope::from_message(&envelopes[0]).unwrap();
        assert_eq!(envelope.destination_topic, "items");
        assert_eq!(envelope.message.uuid(), message.uuid());
    }

    #[tokio::test]
    async fn reserved_topic_is_rejected() {
        let publisher = Publisher::direct(InMemoryStore::default(), RESERVED);

        let err = publisher
            .publish(RESERVED, [Message::new("a")])
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), BusErrorKind::ReservedTopic(t) if t == RESERVED));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn closed_publisher_rejects_publishes() {
        let publisher = Publisher::direct(InMemoryStore::default(), RESERVED);
        publisher.close();

        let err = publisher
            .publish("items", [Message::new("a")])
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), BusErrorKind::Closed));
    }

    #[tokio::test]
    async fn empty_publish_is_a_no_op() {
        let store = InMemoryStore::default();
        let publisher = Publisher::direct(store.clone(), RESERVED);

        publisher.publish("items", Vec::new()).await.unwrap();

        assert_eq!(store.len("items").await, 0);
    }

    #[tokio::test]
    async fn store_failures_name_the_operation_and_topic() {
        let store = InMemoryStore::default();
        store.close().await.unwrap();
        let publisher = Publisher::direct(store, RESERVED);

        let err = publisher
            .publish("items", [Message::new("a")])
            .await
            .unwrap_err();

        assert!(err.is_store());
        assert!(err.to_string().starts_with("publish on items: store error"));
    }

    #[tokio::test]
    async fn transactional_publish_follows_the_transaction() {
        let store = InMemoryStore::default();
        let publisher = Publisher::direct(store.clone(), RESERVED);

        let mut tx = store.begin();
        publisher
            .publish_in_tx(&mut tx, "items", [Message::new("a")])
            .await
            .unwrap();
        tx.rollback();
        assert_eq!(store.len("items").await, 0);

        let mut tx = store.begin();
        publisher
            .publish_in_tx(&mut tx, "items", [Message::new("b")])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.len("items").await, 1);
    }
}
