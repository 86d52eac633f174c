//! Errors returned by bus operations.
//!
//! Every [`BusError`] carries the operation that failed and, where relevant,
//! the topic, plus a tracing span backtrace captured at construction. Callers
//! classify errors with [`BusError::kind`] or the `is_*` helpers instead of
//! matching on messages.

use tracing_error::SpanTrace;

/// Error returned by publish, subscribe, forwarder and lifecycle operations.
#[derive(Debug)]
pub struct BusError {
    context: SpanTrace,
    kind: BusErrorKind,
}

/// Classification of bus errors.
#[derive(Debug)]
pub enum BusErrorKind {
    /// `start_forwarder` was called on a bus without outbox mode.
    NotConfiguredForForwarding,
    /// `start_forwarder` was called more than once.
    ForwarderAlreadyStarted,
    /// The topic is reserved for outbox envelopes.
    ReservedTopic(String),
    /// The publisher or the bus has been shut down.
    Closed,
    /// The caller's cancellation token fired while the operation was waiting.
    Cancelled { operation: &'static str },
    /// A payload or envelope could not be (de)serialized.
    Serde {
        operation: &'static str,
        topic: String,
        source: serde_json::Error,
    },
    /// The message store rejected the operation.
    Store {
        operation: &'static str,
        topic: Option<String>,
        source: tower::BoxError,
    },
}

impl BusError {
    pub(crate) fn new(kind: BusErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub(crate) fn store(
        operation: &'static str,
        topic: Option<&str>,
        source: impl Into<tower::BoxError>,
    ) -> Self {
        Self::new(BusErrorKind::Store {
            operation,
            topic: topic.map(str::to_owned),
            source: source.into(),
        })
    }

    pub(crate) fn serde(operation: &'static str, topic: &str, source: serde_json::Error) -> Self {
        Self::new(BusErrorKind::Serde {
            operation,
            topic: topic.to_owned(),
            source,
        })
    }

    pub(crate) fn cancelled(operation: &'static str) -> Self {
        Self::new(BusErrorKind::Cancelled { operation })
    }

    pub fn kind(&self) -> &BusErrorKind {
        &self.kind
    }

    /// Usage errors that will fail again if retried unchanged.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.kind,
            BusErrorKind::NotConfiguredForForwarding
                | BusErrorKind::ForwarderAlreadyStarted
                | BusErrorKind::ReservedTopic(_)
        )
    }

    /// Failures reported by the underlying store.
    pub fn is_store(&self) -> bool {
        matches!(self.kind, BusErrorKind::Store { .. })
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BusErrorKind::NotConfiguredForForwarding => {
                writeln!(f, "Bus is not configured for forwarding")
            }
            BusErrorKind::ForwarderAlreadyStarted => writeln!(f, "Forwarder already started"),
            BusErrorKind::ReservedTopic(topic) => {
                writeln!(f, "Topic {topic} is reserved for outbox envelopes")
            }
            BusErrorKind::Closed => writeln!(f, "Bus is closed"),
            BusErrorKind::Cancelled { operation } => writeln!(f, "{operation}: cancelled"),
            BusErrorKind::Serde {
                operation,
                topic,
                source,
            } => writeln!(f, "{operation} on {topic}: serde error: {source}"),
            BusErrorKind::Store {
                operation,
                topic: Some(topic),
                source,
            } => writeln!(f, "{operation} on {topic}: store error: {source}"),
            BusErrorKind::Store {
                operation,
                topic: None,
                source,
            } => writeln!(f, "{operation}: store error: {source}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BusErrorKind::Serde { source, .. } => Some(source),
            BusErrorKind::Store { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn configuration_errors_are_distinguishable_from_store_errors() {
        let config = BusError::new(BusErrorKind::NotConfiguredForForwarding);
        let store = BusError::store("publish", Some("orders"), "connection reset");

        assert!(config.is_configuration());
        assert!(!config.is_store());
        assert!(store.is_store());
        assert!(!store.is_configuration());
    }

    #[test]
    fn store_error_names_operation_and_topic() {
        let err = BusError::store("publish", Some("orders"), "connection reset");
        let rendered = err.to_string();

        assert!(rendered.starts_with("publish on orders: store error: connection reset"));
        assert_eq!(err.source().unwrap().to_string(), "connection reset");
    }
}
