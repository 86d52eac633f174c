//! Trace context propagation through message metadata.
//!
//! The bus does not define a tracing format of its own. It treats an
//! OpenTelemetry [`TextMapPropagator`] as an opaque capability and uses
//! [`Metadata`] as the text-map carrier:
//!
//! - on publish, the caller's active context is injected into each message
//! - on subscribe, the context is extracted again and used as the parent of
//!   the handler span
//!
//! By default the globally registered propagator is used, so applications
//! that call `opentelemetry::global::set_text_map_propagator` get W3C trace
//! context (or whatever they registered) without further configuration.

use std::{fmt, sync::Arc};

use opentelemetry::{
    Context,
    propagation::{Extractor, Injector, TextMapPropagator},
};
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

use crate::message::Metadata;

impl Injector for Metadata {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_owned(), value);
    }
}

impl Extractor for Metadata {
    fn get(&self, key: &str) -> Option<&str> {
        Metadata::get(self, key)
    }

    fn keys(&self) -> Vec<&str> {
        self.iter().map(|(k, _)| k).collect()
    }
}

/// Injector/extractor pair used by the publisher and the dispatch loop.
#[derive(Clone, Default)]
pub struct Propagation {
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
}

impl Propagation {
    /// Use the globally registered propagator.
    pub fn global() -> Self {
        Self::default()
    }

    /// Use a specific propagator regardless of the global one.
    pub fn new(propagator: impl TextMapPropagator + Send + Sync + 'static) -> Self {
        Self {
            propagator: Some(Arc::new(propagator)),
        }
    }

    pub fn inject(&self, cx: &Context, metadata: &mut Metadata) {
        match &self.propagator {
            Some(propagator) => propagator.inject_context(cx, metadata),
            None => opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.inject_context(cx, &mut *metadata)
            }),
        }
    }

    pub fn extract(&self, metadata: &Metadata) -> Context {
        match &self.propagator {
            Some(propagator) => propagator.extract_with_context(&Context::new(), metadata),
            None => opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.extract_with_context(&Context::new(), metadata)
            }),
        }
    }
}

impl fmt::Debug for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Propagation")
            .field("global", &self.propagator.is_none())
            .finish()
    }
}

/// OpenTelemetry context of the current `tracing` span.
///
/// Empty when no `tracing-opentelemetry` layer is installed.
pub fn current_context() -> Context {
    tracing::Span::current().context()
}
