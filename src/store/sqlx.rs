use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection as _, PgConnection, PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

use crate::{
    Message,
    message::Metadata,
    store::{ClaimMessages, ClaimRequest, Claimed, EnqueueMessages, Receipt, StoreLifecycle},
};

/// Key for the advisory lock that serializes schema creation across
/// processes starting at the same time.
const SCHEMA_LOCK_KEY: i64 = 0x6c65_7474_6572_626f;

/// PostgreSQL message store.
///
/// Messages live in `letterbox_messages`, one row per (topic, message),
/// stamped with the id of the transaction that wrote them. Per-group
/// delivery state lives in `letterbox_deliveries`, keyed by message offset
/// and consumer group. `letterbox_offsets` keeps one watermark per (topic,
/// group); everything at or below it is acked and no longer has delivery
/// rows. Requires PostgreSQL 13 or later.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a store without touching the schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a store and ensures the tables exist.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_tables(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// Connects a new pool. The schema is created by `Bus::new`.
    #[tracing::instrument(skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new_uninitialized(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction to use with `publish_in_tx`.
    pub async fn begin(&self) -> Result<sqlx::PgTransaction<'static>, Error> {
        Ok(self.pool.begin().await?)
    }
}

#[async_trait]
impl EnqueueMessages for PgStore {
    type Error = Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip(self, messages), fields(count = messages.len()))]
    async fn enqueue(&self, topic: &str, messages: Vec<Message>) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        insert_messages(&mut tx, topic, messages).await?;
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, messages, tx), fields(count = messages.len()))]
    async fn enqueue_in_tx(
        &self,
        topic: &str,
        messages: Vec<Message>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        insert_messages(&mut **tx, topic, messages).await
    }
}

async fn insert_messages(
    conn: &mut PgConnection,
    topic: &str,
    messages: Vec<Message>,
) -> Result<(), Error> {
    for message in messages {
        let metadata = serde_json::to_value(message.metadata())?;

        sqlx::query(
            "INSERT INTO letterbox_messages (uuid, topic, payload, metadata)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(message.uuid())
        .bind(topic)
        .bind(message.payload())
        .bind(metadata)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Claims candidates with `SKIP LOCKED` and records the claim in one
/// statement. The `ON CONFLICT ... WHERE` re-checks the delivery row, so a
/// concurrent claim that committed in between wins and the row is left out.
/// Messages at or below the group's watermark are never scanned.
const CLAIM_QUERY: &str = "
WITH mark AS (
    SELECT
        COALESCE((SELECT acked_tx FROM letterbox_offsets
                  WHERE topic = $1 AND consumer_group = $2), '0'::xid8) AS tx,
        COALESCE((SELECT acked_offset FROM letterbox_offsets
                  WHERE topic = $1 AND consumer_group = $2), 0) AS off
),
candidates AS (
    SELECT m.offset_id
    FROM letterbox_messages m
    CROSS JOIN mark
    LEFT JOIN letterbox_deliveries d
        ON d.offset_id = m.offset_id AND d.consumer_group = $2
    WHERE m.topic = $1
      AND m.offset_id > $3
      AND (m.tx_id, m.offset_id) > (mark.tx, mark.off)
      AND (d.offset_id IS NULL OR (d.state <> 'acked' AND d.visible_at <= now()))
    ORDER BY m.offset_id
    LIMIT $4
    FOR UPDATE OF m SKIP LOCKED
),
claimed AS (
    INSERT INTO letterbox_deliveries
        (offset_id, consumer_group, state, claim_token, visible_at, attempts)
    SELECT offset_id, $2, 'claimed', $5, now() + make_interval(secs => $6), 1
    FROM candidates
    ON CONFLICT (offset_id, consumer_group) DO UPDATE
        SET state = 'claimed',
            claim_token = EXCLUDED.claim_token,
            visible_at = EXCLUDED.visible_at,
            attempts = letterbox_deliveries.attempts + 1
        WHERE letterbox_deliveries.state <> 'acked'
          AND letterbox_deliveries.visible_at <= now()
    RETURNING offset_id, attempts
)
SELECT m.offset_id, m.uuid, m.payload, m.metadata, m.created_at, c.attempts
FROM claimed c
JOIN letterbox_messages m ON m.offset_id = c.offset_id
ORDER BY m.offset_id";

/// Moves the (topic, group) watermark past the longest run of acked
/// messages and drops their delivery rows.
///
/// Messages are ordered by `(tx_id, offset_id)` and only rows written by
/// transactions older than every running one are considered. A transaction
/// still in flight always sorts above the new watermark, so a message that
/// commits late is never skipped.
const ADVANCE_QUERY: &str = "
WITH mark AS (
    SELECT
        COALESCE((SELECT acked_tx FROM letterbox_offsets
                  WHERE topic = $1 AND consumer_group = $2), '0'::xid8) AS tx,
        COALESCE((SELECT acked_offset FROM letterbox_offsets
                  WHERE topic = $1 AND consumer_group = $2), 0) AS off
),
horizon AS (
    SELECT pg_snapshot_xmin(pg_current_snapshot()) AS xmin
),
blocker AS (
    SELECT m.tx_id, m.offset_id
    FROM letterbox_messages m
    CROSS JOIN mark
    CROSS JOIN horizon
    LEFT JOIN letterbox_deliveries d
        ON d.offset_id = m.offset_id AND d.consumer_group = $2
    WHERE m.topic = $1
      AND (m.tx_id, m.offset_id) > (mark.tx, mark.off)
      AND (m.tx_id >= horizon.xmin OR d.state IS DISTINCT FROM 'acked')
    ORDER BY m.tx_id, m.offset_id
    LIMIT 1
),
target AS (
    SELECT m.tx_id, m.offset_id
    FROM letterbox_messages m
    CROSS JOIN mark
    CROSS JOIN horizon
    WHERE m.topic = $1
      AND (m.tx_id, m.offset_id) > (mark.tx, mark.off)
      AND m.tx_id < horizon.xmin
      AND NOT EXISTS (
          SELECT 1 FROM blocker b WHERE (m.tx_id, m.offset_id) >= (b.tx_id, b.offset_id)
      )
    ORDER BY m.tx_id DESC, m.offset_id DESC
    LIMIT 1
),
pruned AS (
    DELETE FROM letterbox_deliveries d
    USING letterbox_messages m, mark, target
    WHERE d.consumer_group = $2
      AND d.offset_id = m.offset_id
      AND m.topic = $1
      AND (m.tx_id, m.offset_id) > (mark.tx, mark.off)
      AND (m.tx_id, m.offset_id) <= (target.tx_id, target.offset_id)
)
INSERT INTO letterbox_offsets (topic, consumer_group, acked_tx, acked_offset)
SELECT $1, $2, tx_id, offset_id FROM target
ON CONFLICT (topic, consumer_group) DO UPDATE
    SET acked_tx = EXCLUDED.acked_tx,
        acked_offset = EXCLUDED.acked_offset
    WHERE (letterbox_offsets.acked_tx, letterbox_offsets.acked_offset)
        < (EXCLUDED.acked_tx, EXCLUDED.acked_offset)";

impl PgStore {
    /// Advance the watermark of `group` on `topic` and prune acked
    /// delivery rows below it. Runs after every ack; safe to call at any
    /// time.
    #[tracing::instrument(skip(self))]
    pub async fn compact(&self, topic: &str, group: &str) -> Result<(), Error> {
        sqlx::query(ADVANCE_QUERY)
            .bind(topic)
            .bind(group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClaimMessages for PgStore {
    type Error = Error;

    async fn head(&self, topic: &str) -> Result<i64, Self::Error> {
        let head: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(offset_id), 0) FROM letterbox_messages WHERE topic = $1",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(head)
    }

    #[tracing::instrument(skip_all, fields(topic = %request.topic, group = %request.group))]
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Claimed>, Self::Error> {
        let claim_token = Uuid::new_v4();

        let rows = sqlx::query(CLAIM_QUERY)
            .bind(&request.topic)
            .bind(&request.group)
            .bind(request.after_offset)
            .bind(i64::try_from(request.limit).unwrap_or(i64::MAX))
            .bind(claim_token)
            .bind(request.lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let offset: i64 = row.try_get("offset_id")?;
            let uuid: Uuid = row.try_get("uuid")?;
            let payload: Vec<u8> = row.try_get("payload")?;
            let metadata_json: serde_json::Value = row.try_get("metadata")?;
            let published_at: DateTime<Utc> = row.try_get("created_at")?;
            let attempts: i32 = row.try_get("attempts")?;

            let metadata: Metadata = serde_json::from_value(metadata_json)?;

            out.push(Claimed {
                receipt: Receipt::new(offset, request.group.clone(), claim_token),
                message: Message::from_parts(uuid, metadata, payload),
                published_at,
                delivery_count: u32::try_from(attempts).unwrap_or(1),
            });
        }

        Ok(out)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), Self::Error> {
        let topic: Option<String> = sqlx::query_scalar(
            "UPDATE letterbox_deliveries d SET state = 'acked', acked_at = now()
             FROM letterbox_messages m
             WHERE d.offset_id = $1 AND d.consumer_group = $2 AND d.claim_token = $3
               AND d.state = 'claimed' AND m.offset_id = d.offset_id
             RETURNING m.topic",
        )
        .bind(receipt.offset())
        .bind(receipt.group())
        .bind(receipt.claim_token())
        .fetch_optional(&self.pool)
        .await?;

        match topic {
            Some(topic) => self.compact(&topic, receipt.group()).await,
            None => {
                tracing::warn!(
                    offset = receipt.offset(),
                    group = receipt.group(),
                    "Claim lost before ack"
                );
                Ok(())
            }
        }
    }

    async fn nack(&self, receipt: &Receipt, redeliver_after: Duration) -> Result<(), Self::Error> {
        let result = sqlx::query(
            "UPDATE letterbox_deliveries
             SET state = 'nacked', visible_at = now() + make_interval(secs => $4)
             WHERE offset_id = $1 AND consumer_group = $2 AND claim_token = $3
               AND state = 'claimed'",
        )
        .bind(receipt.offset())
        .bind(receipt.group())
        .bind(receipt.claim_token())
        .bind(redeliver_after.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                offset = receipt.offset(),
                group = receipt.group(),
                "Claim lost before nack"
            );
        }
        Ok(())
    }

    async fn renew(&self, receipt: &Receipt, lease: Duration) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE letterbox_deliveries
             SET visible_at = now() + make_interval(secs => $4)
             WHERE offset_id = $1 AND consumer_group = $2 AND claim_token = $3
               AND state = 'claimed'",
        )
        .bind(receipt.offset())
        .bind(receipt.group())
        .bind(receipt.claim_token())
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn forget_group(&self, topic: &str, group: &str) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM letterbox_deliveries d
             USING letterbox_messages m
             WHERE d.consumer_group = $2 AND d.offset_id = m.offset_id AND m.topic = $1",
        )
        .bind(topic)
        .bind(group)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM letterbox_offsets WHERE topic = $1 AND consumer_group = $2")
            .bind(topic)
            .bind(group)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StoreLifecycle for PgStore {
    type Error = Error;

    #[tracing::instrument(skip_all)]
    async fn initialize(&self) -> Result<(), Self::Error> {
        create_tables(&self.pool).await
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        self.pool.acquire().await?.ping().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.pool.close().await;
        Ok(())
    }
}

/// Ensures the tables exist.
async fn create_tables(pool: &PgPool) -> Result<(), Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS letterbox_messages (
            offset_id BIGSERIAL PRIMARY KEY,
            uuid UUID NOT NULL,
            topic TEXT NOT NULL,
            payload BYTEA NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            tx_id XID8 NOT NULL DEFAULT pg_current_xact_id(),
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS letterbox_messages_topic_offset_idx
            ON letterbox_messages (topic, offset_id)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS letterbox_messages_topic_tx_offset_idx
            ON letterbox_messages (topic, tx_id, offset_id)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS letterbox_offsets (
            topic TEXT NOT NULL,
            consumer_group TEXT NOT NULL,
            acked_tx XID8 NOT NULL,
            acked_offset BIGINT NOT NULL,
            PRIMARY KEY (topic, consumer_group)
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS letterbox_deliveries (
            offset_id BIGINT NOT NULL REFERENCES letterbox_messages (offset_id) ON DELETE CASCADE,
            consumer_group TEXT NOT NULL,
            state TEXT NOT NULL,
            claim_token UUID NOT NULL,
            visible_at TIMESTAMPTZ NOT NULL,
            attempts INT NOT NULL DEFAULT 1,
            acked_at TIMESTAMPTZ,
            PRIMARY KEY (offset_id, consumer_group)
        )",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Postgres store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgStoreErrorKind,
}

/// Kinds of Postgres store errors.
#[derive(Debug)]
pub enum PgStoreErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> &PgStoreErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStoreErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            PgStoreErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStoreErrorKind::Database(err) => Some(err),
            PgStoreErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Serde(err),
        }
    }
}
