use std::{future::Future, marker::PhantomData, ops::Deref, pin::Pin};

use serde::de::DeserializeOwned;
use tower::{Layer, Service};

use crate::subscriber::Delivery;

/// A [`Delivery`] whose payload has been decoded from JSON.
#[derive(Debug, Clone)]
pub struct JsonDelivery<T> {
    pub delivery: Delivery,
    pub body: T,
}

impl<T> Deref for JsonDelivery<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.body
    }
}

/// Tower `Service` wrapper that deserializes payloads from JSON.
///
/// A payload that does not decode as `T` fails the attempt like any other
/// handler error.
pub struct JsonService<S, T> {
    inner: S,
    _marker: PhantomData<fn() -> T>,
}

impl<S: Clone, T> Clone for JsonService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S, T> Service<Delivery> for JsonService<S, T>
where
    T: DeserializeOwned + Send + 'static,
    S: Service<JsonDelivery<T>, Response = ()> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let body = delivery
                .message()
                .decode_json::<T>()
                .map_err(tower::BoxError::from)?;
            inner
                .call(JsonDelivery { delivery, body })
                .await
                .map_err(Into::<tower::BoxError>::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonService`] to a handler.
///
/// ```rust
/// use letterbox::{Delivery, handler_fn, handler::json::{JsonDelivery, JsonLayer}};
///
/// #[derive(serde::Deserialize)]
/// struct ItemCreated { id: u64 }
///
/// let handler = handler_fn(|item: JsonDelivery<ItemCreated>| async move {
///     println!("item {} created", item.id);
///     Ok::<_, std::convert::Infallible>(())
/// })
/// .layer(JsonLayer::<ItemCreated>::new());
/// # let _ = handler;
/// ```
pub struct JsonLayer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonLayer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonLayer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonLayer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<S, T> Layer<S> for JsonLayer<T> {
    type Service = JsonService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService {
            inner: service,
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, handler_fn};
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemCreated {
        id: u64,
    }

    #[tokio::test]
    async fn json_layer_decodes_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |item: JsonDelivery<ItemCreated>| {
            let tx = tx.clone();
            async move {
                tx.send((item.delivery.topic().to_owned(), item.body))?;
                Ok::<_, tower::BoxError>(())
            }
        })
        .layer(JsonLayer::<ItemCreated>::new());

        let message = Message::json(&ItemCreated { id: 9 }).unwrap();
        handler
            .handle(Delivery::detached("items", message))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(("items".to_owned(), ItemCreated { id: 9 }))
        );
    }

    #[tokio::test]
    async fn invalid_json_fails_the_attempt() {
        let handler = handler_fn(|_: JsonDelivery<ItemCreated>| async {
            Ok::<_, tower::BoxError>(())
        })
        .layer(JsonLayer::<ItemCreated>::new());

        let err = handler
            .handle(Delivery::detached("items", Message::new("not json")))
            .await
            .unwrap_err();

        assert!(err.is::<serde_json::Error>());
    }
}
