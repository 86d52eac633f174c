//! Handler contract for subscriptions.
//!
//! A handler is any Tower `Service<Delivery, Response = ()>`, which lets it
//! be composed with middleware (timeouts, concurrency limits, payload
//! decoding) before it is handed to [`crate::Bus::subscribe`].
//!
//! ## Key components
//!
//! - [`Handler`]: wrapper that normalizes errors into `BoxError`
//! - [`handler_fn`]: build a handler from an async closure
//! - [`json::JsonLayer`]: decode JSON payloads before the inner service runs

pub mod json;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt as _, util::ServiceFn};

use crate::subscriber::Delivery;

/// Tower-compatible message handler.
///
/// The dispatch loop clones the handler for every attempt, so the wrapped
/// service must be `Clone`. Returning `Err` counts as a failed attempt and
/// is retried according to the bus [`crate::RetryPolicy`].
#[derive(Clone)]
pub struct Handler<S> {
    service: S,
}

impl<S> Handler<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Apply a Tower layer to the handler.
    pub fn layer<L>(self, layer: L) -> Handler<L::Service>
    where
        L: tower::Layer<S>,
    {
        Handler {
            service: layer.layer(self.service),
        }
    }
}

impl<S> Handler<S>
where
    S: Service<Delivery, Response = ()> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    /// Run the handler once for `delivery`.
    ///
    /// The returned future owns a clone of the service, so it does not
    /// borrow the handler.
    pub fn handle(
        &self,
        delivery: Delivery,
    ) -> impl Future<Output = Result<(), tower::BoxError>> + Send + use<S> {
        let mut service = self.service.clone();
        async move {
            service
                .ready()
                .await
                .map_err(Into::<tower::BoxError>::into)?
                .call(delivery)
                .await
                .map_err(Into::<tower::BoxError>::into)
        }
    }
}

impl<S> Service<Delivery> for Handler<S>
where
    S: Service<Delivery, Response = ()> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let fut = self.service.call(delivery);
        Box::pin(async move { fut.await.map_err(Into::<tower::BoxError>::into) })
    }
}

/// Build a [`Handler`] from an async closure.
///
/// ```rust
/// use letterbox::{Delivery, handler_fn};
///
/// let handler = handler_fn(|delivery: Delivery| async move {
///     println!("{} bytes on {}", delivery.message().payload().len(), delivery.topic());
///     Ok::<_, std::convert::Infallible>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> Handler<ServiceFn<F>> {
    Handler::new(tower::service_fn(f))
}
