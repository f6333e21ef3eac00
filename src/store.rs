//! Outbox store abstractions and backend drivers.
//!
//! The store is the single shared durable resource of the relay: producers
//! append envelopes to it inside their own transactions, and the relay
//! touches it twice per run, once to fetch a pending batch and once to
//! commit the batch's terminal outcomes.
//!
//! ## Components
//!
//! - [`Outbox`]: producer-facing facade for enqueueing events
//! - [`EnqueueMessages`]: trait for staging envelopes on a caller's transaction
//! - [`FetchPending`]: trait for the relay's ordered batch fetch
//! - [`MarkProcessed`]: trait for the relay's all-or-nothing batch commit
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use async_trait::async_trait;
use serde::Serialize;
use tracing::instrument;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::envelope::{IntegrationEvent, MessageEnvelope};

/// Producer-facing facade over an outbox store driver.
///
/// `Outbox` turns typed events into [`MessageEnvelope`]s and stages them on
/// the caller's transaction, delegating persistence to the driver.
pub struct Outbox<D>(D);

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given store driver.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Stage `event` for publication as part of the caller's transaction.
    ///
    /// The envelope is inserted into the outbox but **not** published;
    /// delivery happens asynchronously when the relay picks it up. The
    /// insert commits when the caller's transaction commits, never
    /// independently.
    ///
    /// Serialization failure surfaces before anything is staged, so the
    /// caller's transaction fails rather than silently dropping the event.
    ///
    /// Returns the id assigned to the envelope.
    #[instrument(skip_all, fields(type_tag = T::TYPE_TAG))]
    pub async fn enqueue<T>(
        &self,
        event: &T,
        tx: &mut D::Transaction<'_>,
    ) -> Result<Uuid, OutboxError>
    where
        D: EnqueueMessages,
        T: IntegrationEvent + Serialize,
    {
        let envelope = MessageEnvelope::new(event).map_err(OutboxError::serialization)?;
        let id = envelope.id;

        self.0
            .enqueue(vec![envelope], tx)
            .await
            .map_err(|e| OutboxError::backend(e.into()))?;

        Ok(id)
    }
}

/// Trait for staging envelopes on a caller's transaction.
///
/// Implementations must ensure the insert becomes durable if and only if
/// the caller's transaction commits.
#[async_trait]
pub trait EnqueueMessages {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Transaction type the insert rides on.
    type Transaction<'a>: Send;

    /// Stage a batch of envelopes on the given transaction.
    async fn enqueue(
        &self,
        envelopes: Vec<MessageEnvelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for the relay's batch fetch.
#[async_trait]
pub trait FetchPending {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Fetch up to `limit` envelopes with `processed_at` unset, ordered by
    /// `occurred_at` ascending.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<MessageEnvelope>, Self::Error>;
}

/// Trait for the relay's batch commit.
#[async_trait]
pub trait MarkProcessed {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Persist the terminal state of the given envelopes in a single
    /// commit. All-or-nothing: on error, no envelope mutation may be
    /// durable.
    async fn mark_processed(&self, envelopes: Vec<MessageEnvelope>) -> Result<(), Self::Error>;
}

/// Error returned by outbox operations.
///
/// Wraps the underlying failure and captures a tracing span backtrace for
/// improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Kinds of outbox errors.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The event could not be serialized; nothing was staged.
    Serialization(serde_json::Error),
    /// The store driver failed.
    Backend(tower::BoxError),
}

impl OutboxError {
    fn serialization(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Serialization(err),
        }
    }

    fn backend(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Backend(err),
        }
    }

    /// Which kind of outbox error this is.
    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Serialization(err) => writeln!(f, "Serialization error: {err}"),
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Serialization(err) => Some(err),
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
        }
    }
}
