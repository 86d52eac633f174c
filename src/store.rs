//! Message store abstractions and backend drivers.
//!
//! The store is responsible for **durability and delivery bookkeeping**:
//! it appends messages to topics and tracks, per consumer group, which
//! messages are claimed, acknowledged or waiting for redelivery. Everything
//! above it (retries, tracing, outbox forwarding) is backend-agnostic.
//!
//! ## Responsibilities
//!
//! - Persist messages atomically, optionally inside a caller transaction
//! - Hand out exclusive, lease-bounded claims per consumer group
//! - Finalize claims on ack and release them on nack
//! - Renew leases of claims that are about to be handled
//!
//! ## Components
//!
//! - [`EnqueueMessages`]: trait for appending messages to a topic
//! - [`ClaimMessages`]: trait for claiming and settling deliveries
//! - [`StoreLifecycle`]: schema setup, health probe and shutdown
//! - [`dequeue`]: lazy claim stream built on [`poller::PollerBuilder`]
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature `postgres`).

pub mod inmemory;
pub mod poller;

#[cfg(feature = "postgres")]
pub mod sqlx;

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Message;

use self::poller::PollerBuilder;

/// Identifies a single claim so it can be acked or nacked.
///
/// A receipt is only honoured while its claim token is still the current
/// one for the (message, group) pair. Once the lease expires and another
/// consumer claims the message, settling the old receipt has no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    offset: i64,
    group: String,
    claim_token: Uuid,
}

impl Receipt {
    pub fn new(offset: i64, group: impl Into<String>, claim_token: Uuid) -> Self {
        Self {
            offset,
            group: group.into(),
            claim_token,
        }
    }

    /// Store-assigned position of the message.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn claim_token(&self) -> Uuid {
        self.claim_token
    }
}

/// A message claimed for one consumer group.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub receipt: Receipt,
    pub message: Message,
    pub published_at: DateTime<Utc>,
    /// How many times this message has been claimed by the group, this claim
    /// included.
    pub delivery_count: u32,
}

/// Parameters of a single claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub topic: String,
    pub group: String,
    /// Only messages with a greater offset are considered.
    pub after_offset: i64,
    pub limit: usize,
    /// How long the claim stays exclusive.
    pub lease: Duration,
}

/// Trait for appending messages to a topic.
///
/// Implementations must store a batch atomically: either every message
/// becomes visible or none does.
#[async_trait::async_trait]
pub trait EnqueueMessages {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;
    /// Transaction type used for atomic insertion alongside application state.
    type Transaction<'a>: Send;

    async fn enqueue(&self, topic: &str, messages: Vec<Message>) -> Result<(), Self::Error>;

    /// Insert through the caller's transaction. Visibility follows the
    /// transaction outcome.
    async fn enqueue_in_tx(
        &self,
        topic: &str,
        messages: Vec<Message>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for claiming and settling deliveries.
#[async_trait::async_trait]
pub trait ClaimMessages {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Offset of the latest message on `topic`, or 0 when it is empty.
    async fn head(&self, topic: &str) -> Result<i64, Self::Error>;

    /// Claim up to `request.limit` messages in offset order.
    ///
    /// A message is claimable for a group when the group has never claimed
    /// it, or when its previous claim was not acked and is visible again.
    /// Messages locked by a concurrent claim are skipped, not waited on.
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Claimed>, Self::Error>;

    /// Mark the claimed message as processed for the receipt's group.
    ///
    /// Backends may also move the group's low-watermark past contiguous
    /// acked messages and drop their delivery records.
    async fn ack(&self, receipt: &Receipt) -> Result<(), Self::Error>;

    /// Release the claim; the message becomes claimable again after
    /// `redeliver_after`.
    async fn nack(
        &self,
        receipt: &Receipt,
        redeliver_after: Duration,
    ) -> Result<(), Self::Error>;

    /// Restart the lease of a claim that is still held.
    ///
    /// Returns `false` when the claim was lost, i.e. its token is no longer
    /// the current one or it was already settled.
    async fn renew(&self, receipt: &Receipt, lease: Duration) -> Result<bool, Self::Error>;

    /// Drop all delivery state of `group` on `topic`.
    async fn forget_group(&self, topic: &str, group: &str) -> Result<(), Self::Error>;
}

/// Backend setup, health and shutdown.
#[async_trait::async_trait]
pub trait StoreLifecycle {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create whatever the backend needs. Must be idempotent.
    async fn initialize(&self) -> Result<(), Self::Error>;

    async fn ping(&self) -> Result<(), Self::Error>;

    async fn close(&self) -> Result<(), Self::Error>;
}

/// Everything the bus needs from a backend.
pub trait MessageStore:
    EnqueueMessages + ClaimMessages + StoreLifecycle + Clone + Send + Sync + 'static
{
}

impl<T> MessageStore for T where
    T: EnqueueMessages + ClaimMessages + StoreLifecycle + Clone + Send + Sync + 'static
{
}

/// Stream claimed messages until `cancel` fires.
///
/// The stream is lazy: a batch is claimed only when the consumer asks for
/// the next item. Items of a batch are handed out one at a time, and each
/// one after the first has its lease restarted right before it is yielded.
/// An item whose claim was lost while it waited (its lease ran out and
/// another consumer took it) is skipped.
///
/// Once `cancel` fires, items that were claimed but not yet handed out are
/// released for immediate redelivery. Storage errors are yielded as `Err`
/// items and polling goes on with the next tick.
pub fn dequeue<S>(
    store: S,
    request: ClaimRequest,
    poller: PollerBuilder,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<Claimed, tower::BoxError>>
where
    S: ClaimMessages + Clone + Send + Sync + 'static,
{
    let lease = request.lease;
    let claim_store = store.clone();
    let mut batches = poller.stream(cancel.clone(), move || {
        let store = claim_store.clone();
        let request = request.clone();
        async move {
            let claimed = store
                .claim(&request)
                .await
                .map_err(Into::<tower::BoxError>::into)?;
            Ok::<_, tower::BoxError>(
                claimed
                    .into_iter()
                    .enumerate()
                    .map(|(i, claimed)| Pending {
                        claimed,
                        renew: i > 0,
                    })
                    .collect::<Vec<_>>(),
            )
        }
    });

    Box::pin(async_stream::stream! {
        while let Some(next) = batches.next().await {
            let Pending { claimed, renew } = match next {
                Ok(pending) => pending,
                Err(err) => {
                    yield Err(err);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                if let Err(err) = store.nack(&claimed.receipt, Duration::ZERO).await {
                    tracing::warn!(
                        offset = claimed.receipt.offset(),
                        error = %err,
                        "Failed to release unhandled claim"
                    );
                }
                continue;
            }

            if renew {
                match store.renew(&claimed.receipt, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            offset = claimed.receipt.offset(),
                            group = claimed.receipt.group(),
                            "Claim lost while queued, skipping"
                        );
                        continue;
                    }
                    Err(err) => {
                        yield Err(tower::BoxError::from(err));
                        continue;
                    }
                }
            }

            yield Ok(claimed);
        }
    })
}

/// A claimed item waiting in the local batch.
struct Pending {
    claimed: Claimed,
    renew: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inmemory::InMemoryStore;

    fn request(topic: &str, group: &str) -> ClaimRequest {
        ClaimRequest {
            topic: topic.into(),
            group: group.into(),
            after_offset: 0,
            limit: 2,
            lease: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_streams_messages_in_offset_order() {
        let store = InMemoryStore::default();
        store
            .enqueue(
                "items",
                vec![Message::new("a"), Message::new("b"), Message::new("c")],
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut stream = dequeue(
            store.clone(),
            request("items", "g"),
            PollerBuilder::new(Duration::from_millis(10)),
            cancel.clone(),
        );

        let mut payloads = Vec::new();
        for _ in 0..3 {
            let claimed = stream.next().await.unwrap().unwrap();
            payloads.push(claimed.message.payload().to_vec());
        }
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_picks_up_messages_published_later() {
        let store = InMemoryStore::default();
        let cancel = CancellationToken::new();
        let mut stream = dequeue(
            store.clone(),
            request("items", "g"),
            PollerBuilder::new(Duration::from_millis(10)),
            cancel.clone(),
        );

        let publisher = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher
                .enqueue("items", vec![Message::new("late")])
                .await
                .unwrap();
        });

        let claimed = stream.next().await.unwrap().unwrap();
        assert_eq!(claimed.message.payload(), b"late");
        assert_eq!(claimed.delivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_yields_store_errors_and_keeps_polling() {
        let store = InMemoryStore::default();
        store.close().await.unwrap();

        let cancel = CancellationToken::new();
        let mut stream = dequeue(
            store,
            request("items", "g"),
            PollerBuilder::new(Duration::from_millis(10)),
            cancel.clone(),
        );

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.unwrap().is_err());

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    fn seeded_request(lease: Duration, limit: usize) -> ClaimRequest {
        ClaimRequest {
            lease,
            limit,
            ..request("items", "g")
        }
    }

    async fn seeded(payloads: &[&str]) -> InMemoryStore {
        let store = InMemoryStore::default();
        store
            .enqueue("items", payloads.iter().map(|p| Message::new(*p)).collect())
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_skips_claims_lost_while_queued() {
        let store = seeded(&["a", "b"]).await;
        let mut stream = dequeue(
            store.clone(),
            seeded_request(Duration::from_secs(5), 2),
            PollerBuilder::new(Duration::from_millis(10)),
            CancellationToken::new(),
        );

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message.payload(), b"a");

        // Both leases run out while "a" is being handled; a second member
        // of the group takes over the queued "b".
        tokio::time::advance(Duration::from_secs(6)).await;
        let taken = store
            .claim(&seeded_request(Duration::from_secs(30), 10))
            .await
            .unwrap();
        assert_eq!(taken.len(), 2);

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(next.is_err(), "lost claim was handed out: {next:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_renews_the_lease_of_queued_claims() {
        let store = seeded(&["a", "b"]).await;
        let mut stream = dequeue(
            store.clone(),
            seeded_request(Duration::from_secs(5), 2),
            PollerBuilder::new(Duration::from_millis(10)),
            CancellationToken::new(),
        );

        let first = stream.next().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message.payload(), b"b");

        // "a" expired at 5s, "b" was renewed at 4s and is held until 9s.
        tokio::time::advance(Duration::from_secs(3)).await;
        let taken = store
            .claim(&seeded_request(Duration::from_secs(30), 10))
            .await
            .unwrap();
        let offsets: Vec<_> = taken.iter().map(|c| c.receipt.offset()).collect();
        assert_eq!(offsets, vec![first.receipt.offset()]);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_releases_unhandled_claims_on_cancel() {
        let store = seeded(&["a", "b", "c"]).await;
        let cancel = CancellationToken::new();
        let mut stream = dequeue(
            store.clone(),
            seeded_request(Duration::from_secs(30), 3),
            PollerBuilder::new(Duration::from_millis(10)),
            cancel.clone(),
        );

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message.payload(), b"a");
        cancel.cancel();
        assert!(stream.next().await.is_none());

        let released = store
            .claim(&seeded_request(Duration::from_secs(30), 10))
            .await
            .unwrap();
        let payloads: Vec<_> = released.iter().map(|c| c.message.payload()).collect();
        assert_eq!(payloads, vec![b"b".as_slice(), b"c".as_slice()]);
    }
}
