use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::envelope::MessageEnvelope;
use crate::store::{EnqueueMessages, FetchPending, MarkProcessed};

/// Postgres-backed outbox store driver.
///
/// Envelopes live in the `outbox_messages` table. Enqueue rides the
/// caller's [`sqlx::PgTransaction`]; the relay's batch commit runs in a
/// single transaction of its own so terminal outcomes are all-or-nothing.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Create a store over an existing pool without touching the schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store and ensure the table and index exist.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, PgStoreError> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl EnqueueMessages for PgOutboxStore {
    type Error = tower::BoxError;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all)]
    async fn enqueue(
        &self,
        envelopes: Vec<MessageEnvelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        for envelope in envelopes {
            sqlx::query(
                "INSERT INTO outbox_messages (id, occurred_at, type_tag, payload) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(envelope.id)
            .bind(envelope.occurred_at)
            .bind(&envelope.type_tag)
            .bind(&envelope.payload)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FetchPending for PgOutboxStore {
    type Error = tower::BoxError;

    #[tracing::instrument(skip(self))]
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<MessageEnvelope>, Self::Error> {
        let rows = sqlx::query(
            "SELECT id, occurred_at, type_tag, payload, processed_at, error \
             FROM outbox_messages \
             WHERE processed_at IS NULL \
             ORDER BY occurred_at ASC \
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MessageEnvelope {
                id: row.try_get::<Uuid, _>("id")?,
                occurred_at: row.try_get::<DateTime<Utc>, _>("occurred_at")?,
                type_tag: row.try_get("type_tag")?,
                payload: row.try_get("payload")?,
                processed_at: row.try_get::<Option<DateTime<Utc>>, _>("processed_at")?,
                error: row.try_get::<Option<String>, _>("error")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl MarkProcessed for PgOutboxStore {
    type Error = tower::BoxError;

    #[tracing::instrument(skip_all)]
    async fn mark_processed(&self, envelopes: Vec<MessageEnvelope>) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            sqlx::query(
                "UPDATE outbox_messages SET processed_at = $2, error = $3 WHERE id = $1",
            )
            .bind(envelope.id)
            .bind(envelope.processed_at)
            .bind(envelope.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Ensures the outbox table and its pending-fetch index exist.
async fn create_table(pool: &PgPool) -> Result<(), PgStoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_messages (
            id UUID PRIMARY KEY,
            occurred_at TIMESTAMPTZ NOT NULL,
            type_tag TEXT NOT NULL,
            payload TEXT NOT NULL,
            processed_at TIMESTAMPTZ,
            error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS outbox_messages_pending_idx \
         ON outbox_messages (processed_at, occurred_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Postgres store errors.
#[derive(Debug)]
pub struct PgStoreError {
    context: tracing_error::SpanTrace,
    kind: PgStoreErrorKind,
}

/// Kinds of Postgres store errors.
#[derive(Debug)]
pub enum PgStoreErrorKind {
    Database(sqlx::Error),
}

impl PgStoreError {
    /// Which kind of Postgres store error this is.
    pub fn kind(&self) -> &PgStoreErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PgStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStoreErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PgStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStoreErrorKind::Database(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for PgStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Database(err),
        }
    }
}
