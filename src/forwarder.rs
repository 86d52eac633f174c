//! Outbox forwarder.
//!
//! In outbox mode publishes land on a reserved topic wrapped in an
//! [`OutboxEnvelope`]. The forwarder claims those envelopes under its own
//! consumer group and republishes the inner message to its destination
//! topic. The envelope is acked only after the republish succeeded, so a
//! crash in between leads to a redelivery, never to a lost message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    Message,
    publisher::Publisher,
    retry::retry_with_backoff,
    store::{self, ClaimRequest, Claimed, MessageStore, poller::PollerBuilder},
    subscriber::DispatchSettings,
};

/// Outbox record: the real topic plus the message to publish there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub destination_topic: String,
    pub message: Message,
}

impl OutboxEnvelope {
    pub fn new(destination_topic: impl Into<String>, message: Message) -> Self {
        Self {
            destination_topic: destination_topic.into(),
            message,
        }
    }

    /// Encode the envelope as a JSON message for the reserved topic.
    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        Message::json(&self)
    }

    pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
        message.decode_json()
    }
}

pub(crate) struct Forwarder<S> {
    pub(crate) store: S,
    pub(crate) topic: Arc<str>,
    pub(crate) group: String,
    pub(crate) publisher: Publisher<S>,
    pub(crate) settings: DispatchSettings,
}

impl<S> Forwarder<S>
where
    S: MessageStore,
{
    pub(crate) async fn run(self, cancel: CancellationToken, ready: oneshot::Sender<()>) {
        let hook = self.settings.hook.clone();
        hook.on_forwarder_startup(&self.topic);

        let request = ClaimRequest {
            topic: self.topic.to_string(),
            group: self.group.clone(),
            after_offset: 0,
            limit: self.settings.batch_size,
            lease: self.settings.claim_lease,
        };
        let mut claims = store::dequeue(
            self.store.clone(),
            request,
            PollerBuilder::new(self.settings.poll_interval).notify_ready(ready),
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

            self.forward(claimed, &cancel).await;
        }

        while claims.next().await.is_some() {}

        hook.on_forwarder_shutdown(&self.topic);
    }

    async fn forward(&self, claimed: Claimed, cancel: &CancellationToken) {
        let Claimed {
            receipt,
            message: raw,
            ..
        } = claimed;
        let settings = &self.settings;
        let topic = &self.topic;

        let OutboxEnvelope {
            destination_topic,
            message,
        } = match OutboxEnvelope::from_message(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                settings.hook.on_envelope_rejected(raw.uuid(), &err);
                if let Err(err) = self.store.nack(&receipt, settings.redelivery_delay).await {
                    settings.hook.on_receipt_error(topic, raw.uuid(), &err);
                }
                return;
            }
        };
        let message_id = message.uuid();
        let span = tracing::info_span!(
            "letterbox.forward",
            destination_topic = %destination_topic,
            %message_id
        );

        let result = retry_with_backoff(
            &settings.retry,
            cancel,
            |_| {
                let publisher = self.publisher.clone();
                let message = message.clone();
                let destination = destination_topic.clone();
                async move {
                    publisher
                        .forward(&destination, message)
                        .await
                        .map_err(tower::BoxError::from)
                }
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
            Ok(_) => {
                settings
                    .hook
                    .on_envelope_forwarded(&destination_topic, message_id);
                if let Err(err) = self.store.ack(&receipt).await {
                    settings.hook.on_receipt_error(topic, message_id, &err);
                }
            }
            Err(err) => {
                settings.hook.on_message_nacked(topic, message_id, &err);
                if let Err(err) = self.store.nack(&receipt, settings.redelivery_delay).await {
                    settings.hook.on_receipt_error(topic, message_id, &err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_a_json_document_with_destination_and_message() {
        let inner = Message::new("hi").with_metadata("traceparent", "00-abc");
        let encoded = OutboxEnvelope::new("items", inner.clone())
            .into_message()
            .unwrap();

        let value: serde_json::Value = encoded.decode_json().unwrap();
        assert_eq!(value["destination_topic"], "items");
        assert_eq!(value["message"]["metadata"]["traceparent"], "00-abc");

        let decoded = OutboxEnvelope::from_message(&encoded).unwrap();
        assert_eq!(decoded.message, inner);
    }

    #[test]
    fn malformed_envelopes_fail_to_decode() {
        assert!(OutboxEnvelope::from_message(&Message::new("{}")).is_err());
        assert!(OutboxEnvelope::from_message(&Message::new("oops")).is_err());
    }
}
