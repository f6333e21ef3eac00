//! Pet-shelter events flowing through the outbox relay, end to end, with
//! the in-memory store and broker. Run with `RUST_LOG=debug` to watch the
//! relay work.

use std::sync::Arc;
use std::time::Duration;

use relaybox::{
    Contracts, InMemoryBroker, InMemoryStore, IntegrationEvent, Outbox, Relay, TriggerBuilder,
    TypeRegistry,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct VolunteerRegistered {
    volunteer_id: u32,
    name: String,
}

impl IntegrationEvent for VolunteerRegistered {
    const TYPE_TAG: &'static str = "shelter.volunteers.VolunteerRegistered";
}

#[derive(Debug, Serialize, Deserialize)]
struct AdoptionRequested {
    animal_id: u32,
    applicant: String,
}

impl IntegrationEvent for AdoptionRequested {
    const TYPE_TAG: &'static str = "shelter.adoptions.AdoptionRequested";
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let store = InMemoryStore::new();
    let registry = Arc::new(TypeRegistry::new(vec![
        Box::new(Contracts::new("shelter.volunteers").register::<VolunteerRegistered>()),
        Box::new(Contracts::new("shelter.adoptions").register::<AdoptionRequested>()),
    ]));
    let broker = Arc::new(InMemoryBroker::default());

    // Producer side: stage a new event every few hundred milliseconds.
    let outbox = Outbox::new(store.clone());
    let cancel_producer = cancel.clone();
    let producer_handle = tokio::spawn(async move {
        let mut id = 0;
        loop {
            if id % 2 == 0 {
                outbox
                    .enqueue(
                        &VolunteerRegistered {
                            volunteer_id: id,
                            name: format!("volunteer-{id}"),
                        },
                        &mut (),
                    )
                    .await
                    .expect("failed to enqueue event");
            } else {
                outbox
                    .enqueue(
                        &AdoptionRequested {
                            animal_id: id,
                            applicant: format!("applicant-{id}"),
                        },
                        &mut (),
                    )
                    .await
                    .expect("failed to enqueue event");
            }
            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if cancel_producer.is_cancelled() {
                break;
            }
        }
    });

    // Relay side: the trigger fires a run every second.
    let relay = Arc::new(Relay::new(store, registry, broker));
    let _trigger = TriggerBuilder::new(Duration::from_secs(1)).start(relay, cancel.clone());

    tokio::try_join!(cancel_handle, producer_handle).unwrap();
}
