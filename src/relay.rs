//! Relay dispatcher: turns pending outbox envelopes into broker publications.
//!
//! One [`Relay::execute`] call is one complete cycle:
//!
//! 1. Fetch up to `batch_size` pending envelopes, ordered by `occurred_at`
//! 2. Fan out one task per envelope; each task exclusively owns its
//!    envelope while it decodes the payload and publishes under the retry
//!    policy
//! 3. Fan in and persist every terminal outcome in a single store commit
//!
//! Individual envelope failures never abort the batch; each outcome is
//! independent. Only a store failure aborts the run's durable effects, in
//! which case the whole batch stays pending and the next run re-selects it.
//! An envelope that already reached the broker before such a failure will
//! be published again: delivery is at-least-once, never exactly-once.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::broker::Broker;
use crate::envelope::MessageEnvelope;
use crate::registry::TypeRegistry;
use crate::retry::{RetryErrorKind, RetryPolicy};
use crate::store::{FetchPending, MarkProcessed};

/// Default number of envelopes fetched per run.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Tunables for one relay instance.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Maximum envelopes fetched per run.
    pub batch_size: usize,
    /// Per-envelope publish retry policy.
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one [`Relay::execute`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A previous run was still in flight; this call did nothing.
    Skipped,
    /// No pending envelopes; nothing was committed.
    Idle,
    /// A batch was processed and committed.
    Completed {
        /// Envelopes that reached the broker.
        published: usize,
        /// Envelopes marked terminally failed.
        failed: usize,
    },
}

/// The outbox relay.
///
/// Holds the store driver, the type registry and the broker, and assumes a
/// trigger drives [`execute`](Self::execute) serially. Overlapping calls
/// are tolerated anyway: the second caller gets [`RelayOutcome::Skipped`]
/// without touching the store.
pub struct Relay<D, B> {
    store: D,
    registry: Arc<TypeRegistry>,
    broker: Arc<B>,
    config: RelayConfig,
    busy: Mutex<()>,
}

impl<D, B> Relay<D, B>
where
    D: FetchPending + MarkProcessed + Send + Sync,
    B: Broker + 'static,
{
    /// Create a relay with the default configuration.
    pub fn new(store: D, registry: Arc<TypeRegistry>, broker: Arc<B>) -> Self {
        Self {
            store,
            registry,
            broker,
            config: RelayConfig::default(),
            busy: Mutex::new(()),
        }
    }

    /// Replace the relay configuration.
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one execution cycle.
    ///
    /// Cancellation is observed at every suspension point; envelopes whose
    /// processing is cut short are abandoned unmutated and stay pending.
    #[tracing::instrument(skip_all)]
    pub async fn execute(&self, cancel: CancellationToken) -> Result<RelayOutcome, RelayError> {
        let _guard = match self.busy.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("previous relay run still in flight, skipping");
                return Ok(RelayOutcome::Skipped);
            }
        };

        let batch = self
            .store
            .fetch_pending(self.config.batch_size)
            .await
            .map_err(|e| RelayError::store(e.into()))?;

        if batch.is_empty() {
            return Ok(RelayOutcome::Idle);
        }

        tracing::debug!(batch_len = batch.len(), "processing outbox batch");

        let mut tasks = JoinSet::new();
        for envelope in batch {
            tasks.spawn(process_one(
                envelope,
                Arc::clone(&self.registry),
                Arc::clone(&self.broker),
                self.config.retry,
                cancel.clone(),
            ));
        }

        let mut done = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(envelope)) => done.push(envelope),
                // Cancelled mid-flight; the envelope stays pending.
                Ok(None) => {}
                Err(err) => tracing::error!(error = %err, "relay worker task failed"),
            }
        }

        if done.is_empty() {
            return Ok(RelayOutcome::Completed {
                published: 0,
                failed: 0,
            });
        }

        let published = done.iter().filter(|e| e.error.is_none()).count();
        let failed = done.len() - published;

        self.store
            .mark_processed(done)
            .await
            .map_err(|e| RelayError::store(e.into()))?;

        tracing::info!(published, failed, "relay run committed");
        Ok(RelayOutcome::Completed { published, failed })
    }
}

/// Process a single envelope to its terminal state.
///
/// The task owns the envelope exclusively until fan-in. Returns `None`
/// when cancellation cut processing short, in which case no mutation is
/// committed and the envelope stays eligible for the next run.
async fn process_one<B>(
    mut envelope: MessageEnvelope,
    registry: Arc<TypeRegistry>,
    broker: Arc<B>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Option<MessageEnvelope>
where
    B: Broker,
{
    let event = match registry.decode(&envelope.type_tag, &envelope.payload) {
        Ok(event) => event,
        // Non-transient: retrying cannot help, terminal without a publish.
        Err(err) => {
            tracing::warn!(
                envelope_id = %envelope.id,
                type_tag = %envelope.type_tag,
                error = %err,
                "envelope payload undecodable, marking terminally failed"
            );
            envelope.mark_failed(err.message());
            return Some(envelope);
        }
    };

    let result = retry
        .run(&cancel, || broker.publish(&event, &cancel))
        .await;

    match result {
        Ok(()) => envelope.mark_published(),
        Err(err) => match err.into_kind() {
            RetryErrorKind::Exhausted(last) => {
                tracing::error!(
                    envelope_id = %envelope.id,
                    type_tag = %envelope.type_tag,
                    error = %last,
                    "publish retries exhausted, marking terminally failed"
                );
                envelope.mark_failed(last.to_string());
            }
            RetryErrorKind::Cancelled => return None,
        },
    }

    Some(envelope)
}

/// Error returned when a relay run cannot make durable progress.
#[derive(Debug)]
pub struct RelayError {
    context: SpanTrace,
    kind: RelayErrorKind,
}

/// Classification of relay run errors.
#[derive(Debug)]
pub enum RelayErrorKind {
    /// The store failed during fetch or batch commit. None of the batch's
    /// in-memory outcomes are durable; the next run re-selects it.
    Store(tower::BoxError),
}

impl RelayError {
    fn store(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RelayErrorKind::Store(err),
        }
    }

    /// Which kind of relay error this is.
    pub fn kind(&self) -> &RelayErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelayErrorKind::Store(err) => Some(err.as_ref()),
        }
    }
}
