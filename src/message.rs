use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Message published on a topic and handed to subscribers.
///
/// A `Message` bundles a unique identifier, a binary payload and a set of
/// string metadata. It is immutable once built: metadata can only be added
/// through the consuming [`Message::with_metadata`] builder, and handlers
/// receive it behind an `Arc`.
///
/// ## Design
///
/// - `uuid` identifies the message across redeliveries
/// - `metadata` carries routing hints and trace context (see
///   [`crate::propagation`])
/// - `payload` is opaque to the bus; interpreting it is the handler's job
///
/// The target topic is not part of the message. It is supplied when
/// publishing and travels with the [`crate::Delivery`] on the consumer side.
///
/// ## Example
///
/// ```rust
/// use letterbox::Message;
///
/// let message = Message::new("hello").with_metadata("content-type", "text/plain");
///
/// assert_eq!(message.payload(), b"hello");
/// assert_eq!(message.metadata().get("content-type"), Some("text/plain"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    uuid: Uuid,
    metadata: Metadata,
    payload: Vec<u8>,
}

impl Message {
    /// Create a message with a fresh UUID v4.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_uuid(Uuid::new_v4(), payload)
    }

    /// Create a message with a caller-chosen identifier.
    pub fn with_uuid(uuid: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            metadata: Metadata::default(),
            payload: payload.into(),
        }
    }

    /// Serialize `value` as JSON and use it as the payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?)
            .with_metadata("content-type", "application/json"))
    }

    /// Attach a metadata entry, replacing any previous value for `key`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Mutable access for the publisher, which stamps trace context before
    /// the message is persisted.
    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub(crate) fn from_parts(uuid: Uuid, metadata: Metadata, payload: Vec<u8>) -> Self {
        Self {
            uuid,
            metadata,
            payload,
        }
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

/// String key/value metadata attached to a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, value);
    }
}

impl From<HashMap<String, String>> for Metadata {
    fn from(value: HashMap<String, String>) -> Self {
        Self(value)
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ItemCreated {
        id: u64,
        name: String,
    }

    #[test]
    fn new_messages_get_distinct_ids() {
        let a = Message::new("a");
        let b = Message::new("a");
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn json_payload_decodes_back() {
        let event = ItemCreated {
            id: 7,
            name: "lamp".into(),
        };
        let message = Message::json(&event).unwrap();

        assert_eq!(
            message.metadata().get("content-type"),
            Some("application/json")
        );
        assert_eq!(message.decode_json::<ItemCreated>().unwrap(), event);
    }

    #[test]
    fn metadata_serializes_as_a_flat_object() {
        let metadata: Metadata = [("traceparent", "00-abc"), ("k", "v")].into_iter().collect();
        let value = serde_json::to_value(&metadata).unwrap();

        assert_eq!(value["traceparent"], "00-abc");
        assert_eq!(value["k"], "v");
    }

    #[test]
    fn with_metadata_overwrites_existing_key() {
        let message = Message::new("x")
            .with_metadata("k", "1")
            .with_metadata("k", "2");

        assert_eq!(message.metadata().get("k"), Some("2"));
        assert_eq!(message.metadata().len(), 1);
    }
}
