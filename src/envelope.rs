use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker trait for events that travel through the outbox.
///
/// `TYPE_TAG` is the logical type name persisted alongside the payload and
/// used by the [`TypeRegistry`](crate::registry::TypeRegistry) to pick a
/// decoder at relay time. Keeping the tag on the type itself means the
/// enqueue side and the decode side can never disagree about it.
///
/// Tags are dotted and namespaced by convention, e.g.
/// `"shelter.volunteers.VolunteerRegistered"`.
pub trait IntegrationEvent {
    /// Logical type name for this event.
    const TYPE_TAG: &'static str;
}

/// One persisted publish intent.
///
/// An envelope is created inside the producer's local transaction and
/// mutated exactly once afterwards, by the relay, when its terminal outcome
/// is known. `payload` and `type_tag` are write-once; only `processed_at`
/// and `error` change.
///
/// A non-null `processed_at` means the envelope is done and will never be
/// selected again, whether the outcome was a successful publish or an
/// exhausted retry budget. Envelopes are retained after processing; this
/// crate never deletes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier, assigned at enqueue time.
    pub id: Uuid,
    /// Creation timestamp; defines processing order within a batch fetch.
    pub occurred_at: DateTime<Utc>,
    /// Logical payload type name, see [`IntegrationEvent::TYPE_TAG`].
    pub type_tag: String,
    /// Serialized event body (JSON text), opaque to the store.
    pub payload: String,
    /// Set when processing reached a terminal outcome.
    pub processed_at: Option<DateTime<Utc>>,
    /// Set only when the terminal outcome was a failure.
    pub error: Option<String>,
}

impl MessageEnvelope {
    /// Build a pending envelope for `event`.
    ///
    /// Serialization failure propagates to the caller so the surrounding
    /// transaction fails rather than silently dropping the event.
    pub fn new<T>(event: &T) -> Result<Self, serde_json::Error>
    where
        T: IntegrationEvent + Serialize,
    {
        Ok(Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            type_tag: T::TYPE_TAG.to_owned(),
            payload: serde_json::to_string(event)?,
            processed_at: None,
            error: None,
        })
    }

    /// Whether this envelope is still eligible for pickup.
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    /// Terminal success: the event reached the broker.
    pub(crate) fn mark_published(&mut self) {
        self.processed_at = Some(Utc::now());
        self.error = None;
    }

    /// Terminal failure: no further automatic attempt will be made.
    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.processed_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}
