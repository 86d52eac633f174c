//! Lifecycle hooks for subscriptions, the forwarder and shutdown.
//!
//! Hooks are invoked synchronously from the bus tasks and should avoid heavy
//! or blocking work. Typical use cases include logging, metrics and tracing
//! integration. [`DefaultBusHook`] logs everything through `tracing`.

use std::time::Duration;

use uuid::Uuid;

/// Hook trait for observing bus lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait BusHook: Send + Sync + 'static {
    fn on_subscribe(&self, topic: &str, group: &str);
    fn on_subscription_end(&self, topic: &str, group: &str);
    fn on_claim_error(&self, topic: &str, error: &dyn std::error::Error);
    fn on_handler_retry(
        &self,
        topic: &str,
        message_id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &dyn std::error::Error,
    );
    fn on_message_acked(&self, topic: &str, message_id: Uuid, attempts: u32);
    fn on_message_nacked(&self, topic: &str, message_id: Uuid, error: &dyn std::error::Error);
    fn on_receipt_error(&self, topic: &str, message_id: Uuid, error: &dyn std::error::Error);
    fn on_error_dropped(&self, topic: &str, message_id: Uuid);
    fn on_forwarder_startup(&self, topic: &str);
    fn on_forwarder_shutdown(&self, topic: &str);
    fn on_envelope_forwarded(&self, destination_topic: &str, message_id: Uuid);
    fn on_envelope_rejected(&self, message_id: Uuid, error: &dyn std::error::Error);
    fn on_shutdown_timeout(&self, timeout: Duration);
}

/// Default hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBusHook;

impl BusHook for DefaultBusHook {
    fn on_subscribe(&self, topic: &str, group: &str) {
        tracing::info!(topic, group, "Subscription started");
    }

    fn on_subscription_end(&self, topic: &str, group: &str) {
        tracing::info!(topic, group, "Subscription stopped");
    }

    fn on_claim_error(&self, topic: &str, error: &dyn std::error::Error) {
        tracing::error!(topic, %error, "Error claiming messages");
    }

    fn on_handler_retry(
        &self,
        topic: &str,
        message_id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &dyn std::error::Error,
    ) {
        tracing::warn!(
            topic,
            %message_id,
            attempt,
            ?delay,
            %error,
            "Handler failed, retrying"
        );
    }

    fn on_message_acked(&self, topic: &str, message_id: Uuid, attempts: u32) {
        tracing::debug!(topic, %message_id, attempts, "Message acked");
    }

    fn on_message_nacked(&self, topic: &str, message_id: Uuid, error: &dyn std::error::Error) {
        tracing::error!(topic, %message_id, %error, "Message nacked");
    }

    fn on_receipt_error(&self, topic: &str, message_id: Uuid, error: &dyn std::error::Error) {
        tracing::error!(topic, %message_id, %error, "Failed to settle claim");
    }

    fn on_error_dropped(&self, topic: &str, message_id: Uuid) {
        tracing::warn!(topic, %message_id, "Error channel full, handler error dropped");
    }

    fn on_forwarder_startup(&self, topic: &str) {
        tracing::info!(topic, "Forwarder is starting up");
    }

    fn on_forwarder_shutdown(&self, topic: &str) {
        tracing::info!(topic, "Forwarder is shutting down");
    }

    fn on_envelope_forwarded(&self, destination_topic: &str, message_id: Uuid) {
        tracing::debug!(destination_topic, %message_id, "Envelope forwarded");
    }

    fn on_envelope_rejected(&self, message_id: Uuid, error: &dyn std::error::Error) {
        tracing::error!(%message_id, %error, "Malformed outbox envelope");
    }

    fn on_shutdown_timeout(&self, timeout: Duration) {
        tracing::warn!(?timeout, "Timed out waiting for bus tasks to finish");
    }
}
