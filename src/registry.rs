//! Type tag resolution for envelope payloads.
//!
//! The relay stores events as opaque JSON plus a string `type_tag`. Before
//! an event can be published it has to be turned back into its concrete
//! type. This module maps tags to decoders through a fixed set of
//! [`ContractModule`]s registered at startup:
//!
//! - [`Contracts`]: the standard module implementation, one per producing
//!   bounded context, built with [`Contracts::register`]
//! - [`TypeRegistry`]: resolves tags against the modules, caching every
//!   successful resolution for the process lifetime
//! - [`DecodedEvent`]: the decoded, publishable result
//!
//! Resolution failures are non-transient: an unknown tag or a malformed
//! payload will never succeed on retry, so the relay marks the envelope
//! terminally failed without attempting a publish.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tracing_error::SpanTrace;

use crate::envelope::IntegrationEvent;

/// Decoder from JSON text to a [`DecodedEvent`].
pub type EventDecoder = Arc<dyn Fn(&str) -> Result<DecodedEvent, serde_json::Error> + Send + Sync>;

/// A decoded event, ready for a broker.
///
/// Carries the typed body (downcastable via [`downcast_ref`](Self::downcast_ref))
/// together with the tag and the original JSON, so both typed and
/// byte-forwarding brokers can work with it.
pub struct DecodedEvent {
    type_tag: String,
    payload: String,
    body: Box<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    /// Logical type name of the event.
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// The original JSON text the event was decoded from.
    pub fn payload_json(&self) -> &str {
        &self.payload
    }

    /// Borrow the typed body, if `T` is the registered type for this tag.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.body.downcast_ref()
    }
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("type_tag", &self.type_tag)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// A named set of event contracts owned by one producing module.
///
/// The registry consults modules in registration order; implementations
/// answer with a decoder when they own the tag.
pub trait ContractModule: Send + Sync {
    /// Module name, for diagnostics.
    fn name(&self) -> &str;

    /// Return a decoder for `type_tag` if this module owns it.
    fn decoder_for(&self, type_tag: &str) -> Option<EventDecoder>;
}

/// The standard [`ContractModule`] implementation.
///
/// Each producing module builds one at startup and registers its event
/// types explicitly:
///
/// ```
/// use relaybox::{Contracts, IntegrationEvent};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct AdoptionRequested {
///     animal_id: u32,
/// }
///
/// impl IntegrationEvent for AdoptionRequested {
///     const TYPE_TAG: &'static str = "shelter.adoptions.AdoptionRequested";
/// }
///
/// let contracts = Contracts::new("shelter.adoptions").register::<AdoptionRequested>();
/// ```
pub struct Contracts {
    name: String,
    decoders: HashMap<&'static str, EventDecoder>,
}

impl Contracts {
    /// Create an empty contract set with the given module name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decoders: HashMap::new(),
        }
    }

    /// Register `T` under its [`IntegrationEvent::TYPE_TAG`].
    pub fn register<T>(mut self) -> Self
    where
        T: IntegrationEvent + DeserializeOwned + Send + Sync + 'static,
    {
        let decoder: EventDecoder = Arc::new(|payload: &str| {
            let body: T = serde_json::from_str(payload)?;
            Ok(DecodedEvent {
                type_tag: T::TYPE_TAG.to_owned(),
                payload: payload.to_owned(),
                body: Box::new(body),
            })
        });
        self.decoders.insert(T::TYPE_TAG, decoder);
        self
    }
}

impl ContractModule for Contracts {
    fn name(&self) -> &str {
        &self.name
    }

    fn decoder_for(&self, type_tag: &str) -> Option<EventDecoder> {
        self.decoders.get(type_tag).cloned()
    }
}

/// Resolves type tags to decoders over a fixed set of contract modules.
///
/// The module set is handed over once at construction and never changes.
/// Resolution is lazy: nothing is looked up until the first
/// [`decode`](Self::decode), and every successful resolution is cached, so
/// a previously-resolved tag never consults the modules again. The cache
/// takes concurrent reads; a miss takes the write lock once to store the
/// first match.
pub struct TypeRegistry {
    modules: Vec<Box<dyn ContractModule>>,
    cache: RwLock<HashMap<String, EventDecoder>>,
}

impl TypeRegistry {
    /// Create a registry over the given contract modules.
    pub fn new(modules: Vec<Box<dyn ContractModule>>) -> Self {
        Self {
            modules,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Decode `payload` as the type registered under `type_tag`.
    pub fn decode(&self, type_tag: &str, payload: &str) -> Result<DecodedEvent, DecodeError> {
        let decoder = self.resolve(type_tag)?;
        decoder(payload).map_err(|source| DecodeError::payload(type_tag, source))
    }

    /// Resolve `type_tag` to a decoder, scanning modules on a cache miss.
    pub fn resolve(&self, type_tag: &str) -> Result<EventDecoder, DecodeError> {
        // Lock poisoning can only come from a panicking reader; the map
        // itself stays valid, so recover the guard.
        let cached = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(type_tag)
            .cloned();
        if let Some(decoder) = cached {
            return Ok(decoder);
        }

        for module in &self.modules {
            if let Some(decoder) = module.decoder_for(type_tag) {
                tracing::debug!(type_tag, module = module.name(), "resolved event type");
                let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
                // Another task may have raced the scan; keep whichever
                // decoder landed first.
                let decoder = cache
                    .entry(type_tag.to_owned())
                    .or_insert(decoder)
                    .clone();
                return Ok(decoder);
            }
        }

        Err(DecodeError::type_not_found(type_tag))
    }
}

/// Error produced when an envelope payload cannot be decoded.
///
/// Both kinds are non-transient: retrying cannot make an unknown tag known
/// or a malformed payload well-formed. The relay records them as the
/// envelope's terminal error without a publish attempt.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    kind: DecodeErrorKind,
}

/// Kinds of decode failures.
#[derive(Debug)]
pub enum DecodeErrorKind {
    /// No contract module owns the tag.
    TypeNotFound { type_tag: String },
    /// The payload failed to deserialize into the registered type.
    Payload {
        type_tag: String,
        source: serde_json::Error,
    },
}

impl DecodeError {
    fn type_not_found(type_tag: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DecodeErrorKind::TypeNotFound {
                type_tag: type_tag.to_owned(),
            },
        }
    }

    fn payload(type_tag: &str, source: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DecodeErrorKind::Payload {
                type_tag: type_tag.to_owned(),
                source,
            },
        }
    }

    /// Which kind of decode failure this is.
    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }

    /// The descriptive message alone, without the captured span context.
    ///
    /// This is what the relay persists on the envelope; the span context
    /// belongs in logs, not in a durable column.
    pub fn message(&self) -> String {
        match &self.kind {
            DecodeErrorKind::TypeNotFound { type_tag } => {
                format!("no contract module provides event type '{type_tag}'")
            }
            DecodeErrorKind::Payload { type_tag, source } => {
                format!("payload for '{type_tag}' failed to deserialize: {source}")
            }
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message())?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DecodeErrorKind::TypeNotFound { .. } => None,
            DecodeErrorKind::Payload { source, .. } => Some(source),
        }
    }
}
