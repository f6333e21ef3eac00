//! Broker seam and in-memory backend.
//!
//! The broker is deliberately a thin trait: the relay hands it a decoded
//! event and a cancellation token, and any error it returns is treated as
//! transient and retried under the relay's [`RetryPolicy`](crate::RetryPolicy).
//! Downstream consumers must tolerate duplicates; the outbox contract is
//! at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::registry::DecodedEvent;

/// Trait implemented by concrete broker backends.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one event.
    ///
    /// Implementations should observe `cancel` at their own suspension
    /// points; the relay also observes it between attempts.
    async fn publish(
        &self,
        event: &DecodedEvent,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError>;
}

/// In-memory broker for testing or local pipelines.
///
/// Records published events as `(type_tag, payload_json)` pairs in a shared
/// queue. Useful for unit and integration testing and for debugging event
/// flows without a real broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    published: Arc<Mutex<Vec<(String, String)>>>,
}

impl InMemoryBroker {
    /// Return everything published so far and clear the internal queue.
    ///
    /// Primarily intended for assertions in tests.
    pub async fn published(&self) -> Vec<(String, String)> {
        let mut queue = self.published.lock().await;
        std::mem::take(&mut *queue)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    #[tracing::instrument(skip_all, fields(type_tag = event.type_tag()))]
    async fn publish(
        &self,
        event: &DecodedEvent,
        _cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        let mut queue = self.published.lock().await;
        queue.push((event.type_tag().to_owned(), event.payload_json().to_owned()));
        tracing::info!("event published to in-memory broker");
        Ok(())
    }
}
