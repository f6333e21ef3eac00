//! End-to-end relay behavior over the in-memory store and scripted brokers.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relaybox::{
    Broker, ContractModule, Contracts, DecodedEvent, EnqueueMessages, EventDecoder, InMemoryStore,
    IntegrationEvent, MessageEnvelope, Outbox, Relay, RelayConfig, RelayOutcome, RetryPolicy,
    TypeRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct VolunteerRegistered {
    volunteer_id: u32,
}

impl IntegrationEvent for VolunteerRegistered {
    const TYPE_TAG: &'static str = "shelter.volunteers.VolunteerRegistered";
}

fn shelter_registry() -> Arc<TypeRegistry> {
    Arc::new(TypeRegistry::new(vec![Box::new(
        Contracts::new("shelter.volunteers").register::<VolunteerRegistered>(),
    )]))
}

fn raw_envelope(type_tag: &str, payload: &str, occurred_at: DateTime<Utc>) -> MessageEnvelope {
    MessageEnvelope {
        id: Uuid::new_v4(),
        occurred_at,
        type_tag: type_tag.to_owned(),
        payload: payload.to_owned(),
        processed_at: None,
        error: None,
    }
}

/// Broker that fails a scripted number of leading calls, counting each
/// invocation (including the failing ones).
#[derive(Clone, Default)]
struct ScriptedBroker {
    calls: Arc<AtomicU32>,
    fail_first: Arc<AtomicU32>,
}

impl ScriptedBroker {
    fn failing(n: u32) -> Self {
        let broker = Self::default();
        broker.fail_first.store(n, Ordering::SeqCst);
        broker
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn publish(
        &self,
        _event: &DecodedEvent,
        _cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(format!("broker down (call {call})").into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn processed_envelopes_are_never_selected_again() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::default());
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone());

    let outbox = Outbox::new(store.clone());
    outbox
        .enqueue(&VolunteerRegistered { volunteer_id: 1 }, &mut ())
        .await
        .unwrap();
    outbox
        .enqueue(&VolunteerRegistered { volunteer_id: 2 }, &mut ())
        .await
        .unwrap();

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 2,
            failed: 0
        }
    );
    assert_eq!(broker.calls(), 2);

    // Both envelopes are done; the next run has nothing to pick up.
    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RelayOutcome::Idle);
    assert_eq!(broker.calls(), 2);
}

#[tokio::test]
async fn failed_batch_commit_republishes_on_next_run() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::default());
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone());

    Outbox::new(store.clone())
        .enqueue(&VolunteerRegistered { volunteer_id: 7 }, &mut ())
        .await
        .unwrap();

    store.fail_next_commits(1).await;
    assert!(relay.execute(CancellationToken::new()).await.is_err());
    assert_eq!(broker.calls(), 1);

    // Nothing durable happened; the envelope is still pending and gets
    // published a second time. At-least-once, not exactly-once.
    assert!(store.snapshot().await[0].is_pending());

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 1,
            failed: 0
        }
    );
    assert_eq!(broker.calls(), 2);
}

#[tokio::test]
async fn batch_fetch_is_ordered_and_bounded() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::default());
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone()).with_config(
        RelayConfig {
            batch_size: 2,
            retry: RetryPolicy::default(),
        },
    );

    let now = Utc::now();
    let t1 = raw_envelope(
        VolunteerRegistered::TYPE_TAG,
        r#"{"volunteer_id":1}"#,
        now - ChronoDuration::seconds(30),
    );
    let t2 = raw_envelope(
        VolunteerRegistered::TYPE_TAG,
        r#"{"volunteer_id":2}"#,
        now - ChronoDuration::seconds(20),
    );
    let t3 = raw_envelope(
        VolunteerRegistered::TYPE_TAG,
        r#"{"volunteer_id":3}"#,
        now - ChronoDuration::seconds(10),
    );
    store
        .enqueue(vec![t3.clone(), t1.clone(), t2.clone()], &mut ())
        .await
        .unwrap();

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 2,
            failed: 0
        }
    );

    let snapshot = store.snapshot().await;
    let by_id = |id: Uuid| snapshot.iter().find(|e| e.id == id).unwrap();
    assert!(!by_id(t1.id).is_pending());
    assert!(!by_id(t2.id).is_pending());
    assert!(by_id(t3.id).is_pending());
}

#[tokio::test(start_paused = true)]
async fn publish_succeeds_within_retry_budget() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::failing(2));
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone());

    Outbox::new(store.clone())
        .enqueue(&VolunteerRegistered { volunteer_id: 4 }, &mut ())
        .await
        .unwrap();

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 1,
            failed: 0
        }
    );
    assert_eq!(broker.calls(), 3);

    let envelope = &store.snapshot().await[0];
    assert!(!envelope.is_pending());
    assert_eq!(envelope.error, None);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_record_last_error_and_stop() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::failing(3));
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone());

    Outbox::new(store.clone())
        .enqueue(&VolunteerRegistered { volunteer_id: 5 }, &mut ())
        .await
        .unwrap();

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 0,
            failed: 1
        }
    );
    assert_eq!(broker.calls(), 3);

    let envelope = &store.snapshot().await[0];
    assert!(!envelope.is_pending());
    assert_eq!(envelope.error.as_deref(), Some("broker down (call 3)"));

    // Terminal failure: a later run does not pick it up again.
    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RelayOutcome::Idle);
    assert_eq!(broker.calls(), 3);
}

#[tokio::test]
async fn unresolvable_type_fails_without_publishing() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::default());
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone());

    store
        .enqueue(
            vec![raw_envelope("Unknown.Event", "{}", Utc::now())],
            &mut (),
        )
        .await
        .unwrap();

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 0,
            failed: 1
        }
    );
    assert_eq!(broker.calls(), 0);

    let envelope = &store.snapshot().await[0];
    assert!(!envelope.is_pending());
    assert_eq!(
        envelope.error.as_deref(),
        Some("no contract module provides event type 'Unknown.Event'")
    );
}

#[tokio::test]
async fn malformed_payload_fails_without_publishing() {
    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::default());
    let relay = Relay::new(store.clone(), shelter_registry(), broker.clone());

    store
        .enqueue(
            vec![raw_envelope(
                VolunteerRegistered::TYPE_TAG,
                "not json",
                Utc::now(),
            )],
            &mut (),
        )
        .await
        .unwrap();

    let outcome = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 0,
            failed: 1
        }
    );
    assert_eq!(broker.calls(), 0);
}

/// Contract module that counts how often the registry consults it.
struct CountingContracts {
    inner: Contracts,
    scans: Arc<AtomicUsize>,
}

impl ContractModule for CountingContracts {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn decoder_for(&self, type_tag: &str) -> Option<EventDecoder> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.decoder_for(type_tag)
    }
}

#[tokio::test]
async fn resolved_type_is_cached_across_runs() {
    let scans = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(TypeRegistry::new(vec![Box::new(CountingContracts {
        inner: Contracts::new("shelter.volunteers").register::<VolunteerRegistered>(),
        scans: scans.clone(),
    })]));

    let store = InMemoryStore::new();
    let broker = Arc::new(ScriptedBroker::default());
    let relay = Relay::new(store.clone(), registry, broker);
    let outbox = Outbox::new(store.clone());

    for id in 0..2 {
        outbox
            .enqueue(&VolunteerRegistered { volunteer_id: id }, &mut ())
            .await
            .unwrap();
        relay.execute(CancellationToken::new()).await.unwrap();
    }

    assert_eq!(scans.load(Ordering::SeqCst), 1);
}

/// Broker that reports when a publish starts, then blocks until the test
/// hands it a permit.
struct GatedBroker {
    entered: mpsc::UnboundedSender<()>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Broker for GatedBroker {
    async fn publish(
        &self,
        _event: &DecodedEvent,
        _cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        let _ = self.entered.send(());
        self.gate.acquire().await?.forget();
        Ok(())
    }
}

/// Broker that reports when a publish starts, then honors the token and
/// aborts with an error once the run is cancelled.
struct CancelAwareBroker {
    entered: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl Broker for CancelAwareBroker {
    async fn publish(
        &self,
        _event: &DecodedEvent,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        let _ = self.entered.send(());
        cancel.cancelled().await;
        Err("publish aborted by shutdown".into())
    }
}

#[tokio::test]
async fn cancelled_run_abandons_envelopes_without_mutation() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let broker = Arc::new(CancelAwareBroker { entered: entered_tx });
    let store = InMemoryStore::new();
    let relay = Arc::new(Relay::new(store.clone(), shelter_registry(), broker));

    Outbox::new(store.clone())
        .enqueue(&VolunteerRegistered { volunteer_id: 11 }, &mut ())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run_relay = relay.clone();
    let run = tokio::spawn(async move { run_relay.execute(run_cancel).await });

    // Cancel only once the run is provably mid-publish.
    entered_rx.recv().await.unwrap();
    cancel.cancel();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            published: 0,
            failed: 0
        }
    );

    // The envelope was abandoned unmutated and stays eligible for the
    // next run.
    let envelope = &store.snapshot().await[0];
    assert!(envelope.is_pending());
    assert_eq!(envelope.error, None);
}

#[tokio::test]
async fn overlapping_execute_is_a_no_op() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let broker = Arc::new(GatedBroker {
        entered: entered_tx,
        gate: gate.clone(),
    });

    let store = InMemoryStore::new();
    let relay = Arc::new(Relay::new(store.clone(), shelter_registry(), broker));

    Outbox::new(store.clone())
        .enqueue(&VolunteerRegistered { volunteer_id: 9 }, &mut ())
        .await
        .unwrap();

    let slow_relay = relay.clone();
    let first = tokio::spawn(async move { slow_relay.execute(CancellationToken::new()).await });

    // Wait until the first run is provably mid-publish.
    entered_rx.recv().await.unwrap();

    let second = relay.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(second, RelayOutcome::Skipped);

    gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(
        first,
        RelayOutcome::Completed {
            published: 1,
            failed: 0
        }
    );
}
