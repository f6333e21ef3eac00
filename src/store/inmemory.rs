use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::envelope::MessageEnvelope;
use crate::store::{EnqueueMessages, FetchPending, MarkProcessed};

/// An in-memory outbox store for testing or local usage.
///
/// Keeps envelopes in a `Vec` behind a mutex and supports enqueue, ordered
/// pending fetch, and all-or-nothing batch commit. Commit failures can be
/// injected with [`fail_next_commits`](Self::fail_next_commits) to exercise
/// the relay's at-least-once behavior.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    envelopes: Vec<MessageEnvelope>,
    failing_commits: u32,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `mark_processed` fail without applying
    /// any mutation.
    pub async fn fail_next_commits(&self, n: u32) {
        self.inner.lock().await.failing_commits = n;
    }

    /// A copy of every envelope currently in the store.
    pub async fn snapshot(&self) -> Vec<MessageEnvelope> {
        self.inner.lock().await.envelopes.clone()
    }
}

#[async_trait]
impl EnqueueMessages for InMemoryStore {
    type Error = InMemoryStoreError;
    type Transaction<'a> = ();

    /// Append envelopes to the in-memory store.
    ///
    /// There is no real transaction here; the unit transaction type lets
    /// callers exercise the same call shape as a database-backed driver.
    async fn enqueue(
        &self,
        envelopes: Vec<MessageEnvelope>,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        self.inner.lock().await.envelopes.extend(envelopes);
        Ok(())
    }
}

#[async_trait]
impl FetchPending for InMemoryStore {
    type Error = InMemoryStoreError;

    /// Return pending envelopes ordered by `occurred_at`, then id for a
    /// stable order under equal timestamps.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<MessageEnvelope>, Self::Error> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<_> = inner
            .envelopes
            .iter()
            .filter(|e| e.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.occurred_at, e.id));
        pending.truncate(limit);
        Ok(pending)
    }
}

#[async_trait]
impl MarkProcessed for InMemoryStore {
    type Error = InMemoryStoreError;

    /// Apply the terminal state of every given envelope, or nothing at all
    /// when a commit failure is scripted.
    async fn mark_processed(&self, envelopes: Vec<MessageEnvelope>) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;

        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(InMemoryStoreError::commit_failed());
        }

        for updated in envelopes {
            let stored = inner
                .envelopes
                .iter_mut()
                .find(|e| e.id == updated.id)
                .ok_or_else(InMemoryStoreError::not_found)?;
            *stored = updated;
        }
        Ok(())
    }
}

/// Error type for [`InMemoryStore`] operations.
#[derive(Debug)]
pub struct InMemoryStoreError {
    kind: InMemoryStoreErrorKind,
}

#[derive(Debug)]
enum InMemoryStoreErrorKind {
    NotFound,
    CommitFailed,
}

impl InMemoryStoreError {
    fn not_found() -> Self {
        Self {
            kind: InMemoryStoreErrorKind::NotFound,
        }
    }

    fn commit_failed() -> Self {
        Self {
            kind: InMemoryStoreErrorKind::CommitFailed,
        }
    }
}

impl std::fmt::Display for InMemoryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryStoreErrorKind::NotFound => {
                write!(f, "envelope not found in in-memory store")
            }
            InMemoryStoreErrorKind::CommitFailed => {
                write!(f, "injected commit failure in in-memory store")
            }
        }
    }
}

impl std::error::Error for InMemoryStoreError {}
