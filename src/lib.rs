#![doc = include_str!("../README.md")]

pub mod broker;
pub mod envelope;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod store;
pub mod trigger;

#[doc(inline)]
pub use envelope::{IntegrationEvent, MessageEnvelope};

#[doc(inline)]
pub use store::{
    EnqueueMessages, FetchPending, MarkProcessed, Outbox, OutboxError, OutboxErrorKind,
};

#[doc(inline)]
pub use store::inmemory::InMemoryStore;

#[doc(inline)]
pub use registry::{
    ContractModule, Contracts, DecodeError, DecodeErrorKind, DecodedEvent, EventDecoder,
    TypeRegistry,
};

#[doc(inline)]
pub use retry::{RetryError, RetryErrorKind, RetryPolicy};

#[doc(inline)]
pub use broker::{Broker, InMemoryBroker};

#[doc(inline)]
pub use relay::{Relay, RelayConfig, RelayError, RelayErrorKind, RelayOutcome};

#[doc(inline)]
pub use trigger::{Trigger, TriggerBuilder};
