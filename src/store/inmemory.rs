use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

use crate::{
    Message,
    store::{ClaimMessages, ClaimRequest, Claimed, EnqueueMessages, Receipt, StoreLifecycle},
};

/// An in-memory message store for testing or local usage.
///
/// Timestamps used for leases and redelivery come from `tokio::time`, so
/// the store follows a paused test clock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    last_offset: i64,
    topics: HashMap<String, Vec<Stored>>,
    deliveries: HashMap<(i64, String), Delivery>,
    /// Per (topic, group): every message at or below this offset is acked
    /// and its delivery record has been dropped.
    watermarks: HashMap<(String, String), i64>,
    closed: bool,
}

struct Stored {
    offset: i64,
    message: Message,
    published_at: DateTime<Utc>,
}

struct Delivery {
    topic: String,
    state: DeliveryState,
    claim_token: Uuid,
    visible_at: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Claimed,
    Nacked,
    Acked,
}

impl State {
    fn append(&mut self, topic: &str, messages: Vec<Message>) {
        let published_at = Utc::now();
        for message in messages {
            self.last_offset += 1;
            let offset = self.last_offset;
            self.topics.entry(topic.to_owned()).or_default().push(Stored {
                offset,
                message,
                published_at,
            });
        }
    }

    fn ensure_open(&self) -> Result<(), InMemoryStoreError> {
        if self.closed {
            Err(InMemoryStoreError::closed())
        } else {
            Ok(())
        }
    }

    /// Current claim for the receipt, if it still holds.
    fn current(&mut self, receipt: &Receipt) -> Option<&mut Delivery> {
        self.deliveries
            .get_mut(&(receipt.offset(), receipt.group().to_owned()))
            .filter(|d| {
                d.state == DeliveryState::Claimed && d.claim_token == receipt.claim_token()
            })
    }

    fn watermark(&self, topic: &str, group: &str) -> i64 {
        self.watermarks
            .get(&(topic.to_owned(), group.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    /// Move the group's watermark past contiguous acked messages.
    fn advance(&mut self, topic: &str, group: &str) {
        let Self {
            topics,
            deliveries,
            watermarks,
            ..
        } = self;
        let Some(messages) = topics.get(topic) else {
            return;
        };
        let mark = watermarks
            .entry((topic.to_owned(), group.to_owned()))
            .or_default();

        let start = messages.partition_point(|m| m.offset <= *mark);
        for stored in &messages[start..] {
            let key = (stored.offset, group.to_owned());
            let acked = matches!(deliveries.get(&key), Some(d) if d.state == DeliveryState::Acked);
            if !acked {
                break;
            }
            deliveries.remove(&key);
            *mark = stored.offset;
        }
    }
}

impl InMemoryStore {
    /// Start a transaction whose writes become visible on [`InMemoryTransaction::commit`].
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            store: self.clone(),
            staged: Vec::new(),
        }
    }

    /// Number of messages stored on `topic`.
    pub async fn len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// Staged writes against an [`InMemoryStore`].
///
/// Dropping the transaction without committing discards the writes.
pub struct InMemoryTransaction {
    store: InMemoryStore,
    staged: Vec<(String, Vec<Message>)>,
}

impl InMemoryTransaction {
    pub async fn commit(self) -> Result<(), InMemoryStoreError> {
        let mut state = self.store.state.lock().await;
        state.ensure_open()?;
        for (topic, messages) in self.staged {
            state.append(&topic, messages);
        }
        Ok(())
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl EnqueueMessages for InMemoryStore {
    type Error = InMemoryStoreError;
    type Transaction<'a> = InMemoryTransaction;

    async fn enqueue(&self, topic: &str, messages: Vec<Message>) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.append(topic, messages);
        Ok(())
    }

    async fn enqueue_in_tx(
        &self,
        topic: &str,
        messages: Vec<Message>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        self.state.lock().await.ensure_open()?;
        tx.staged.push((topic.to_owned(), messages));
        Ok(())
    }
}

#[async_trait]
impl ClaimMessages for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn head(&self, topic: &str) -> Result<i64, Self::Error> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state
            .topics
            .get(topic)
            .and_then(|messages| messages.last())
            .map_or(0, |m| m.offset))
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Claimed>, Self::Error> {
        let mut guard = self.state.lock().await;
        guard.ensure_open()?;
        let state = &mut *guard;

        let Some(messages) = state.topics.get(&request.topic) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let claim_token = Uuid::new_v4();
        let mut claimed = Vec::new();

        let after = request
            .after_offset
            .max(state.watermark(&request.topic, &request.group));
        let start = messages.partition_point(|m| m.offset <= after);

        for stored in &messages[start..] {
            if claimed.len() >= request.limit {
                break;
            }

            let key = (stored.offset, request.group.clone());
            let count = match state.deliveries.get_mut(&key) {
                None => {
                    state.deliveries.insert(
                        key,
                        Delivery {
                            topic: request.topic.clone(),
                            state: DeliveryState::Claimed,
                            claim_token,
                            visible_at: now + request.lease,
                            count: 1,
                        },
                    );
                    1
                }
                Some(d) if d.state != DeliveryState::Acked && d.visible_at <= now => {
                    d.state = DeliveryState::Claimed;
                    d.claim_token = claim_token;
                    d.visible_at = now + request.lease;
                    d.count += 1;
                    d.count
                }
                Some(_) => continue,
            };

            claimed.push(Claimed {
                receipt: Receipt::new(stored.offset, request.group.clone(), claim_token),
                message: stored.message.clone(),
                published_at: stored.published_at,
                delivery_count: count,
            });
        }

        Ok(claimed)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let topic = match state.current(receipt) {
            Some(delivery) => {
                delivery.state = DeliveryState::Acked;
                delivery.topic.clone()
            }
            None => {
                tracing::warn!(
                    offset = receipt.offset(),
                    group = receipt.group(),
                    "Claim lost before ack"
                );
                return Ok(());
            }
        };
        state.advance(&topic, receipt.group());
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, redeliver_after: Duration) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        match state.current(receipt) {
            Some(delivery) => {
                delivery.state = DeliveryState::Nacked;
                delivery.visible_at = Instant::now() + redeliver_after;
            }
            None => tracing::warn!(
                offset = receipt.offset(),
                group = receipt.group(),
                "Claim lost before nack"
            ),
        }
        Ok(())
    }

    async fn renew(&self, receipt: &Receipt, lease: Duration) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        Ok(match state.current(receipt) {
            Some(delivery) => {
                delivery.visible_at = Instant::now() + lease;
                true
            }
            None => false,
        })
    }

    async fn forget_group(&self, topic: &str, group: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state
            .deliveries
            .retain(|(_, g), d| !(g == group && d.topic == topic));
        state
            .watermarks
            .remove(&(topic.to_owned(), group.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl StoreLifecycle for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn initialize(&self) -> Result<(), Self::Error> {
        self.state.lock().await.ensure_open()
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        self.state.lock().await.ensure_open()
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// Error type for `InMemoryStore` operations.
#[derive(Debug)]
pub struct InMemoryStoreError {
    kind: InMemoryStoreErrorKind,
}

impl InMemoryStoreError {
    fn closed() -> Self {
        Self {
            kind: InMemoryStoreErrorKind::Closed,
        }
    }
}

impl std::fmt::Display for InMemoryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryStoreErrorKind::Closed => write!(f, "In-memory store is closed"),
        }
    }
}

impl std::error::Error for InMemoryStoreError {}

#[derive(Debug)]
enum InMemoryStoreErrorKind {
    Closed,
}
