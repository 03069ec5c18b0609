use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use super::errors::EngineResult;
use super::metadata::TypeDescriptor;

// ============================================================================
// Aggregate Identity
// ============================================================================

/// Opaque aggregate identity.
///
/// Stored as text so every backend can index it. Complex identity values are
/// reduced to their canonical JSON form with [`AggregateId::from_value`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build an id from any serializable identity (tuples, structs, ...).
    /// Plain strings stay as they are, everything else becomes canonical JSON.
    pub fn from_value<T: Serialize>(value: &T) -> EngineResult<Self> {
        match serde_json::to_value(value)? {
            serde_json::Value::String(s) => Ok(Self(s)),
            other => Ok(Self(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for AggregateId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Event Envelope - positional and type metadata around a domain event
// ============================================================================

/// Generic Event Envelope - wraps any domain event with metadata
///
/// `sequence_number` starts at 1 per `(aggregate_id, aggregate_type)` stream.
/// 0 means "unsequenced" (legacy streams); those are ordered by `timestamp`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventEnvelope<E> {
    // Event Identity
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,

    // Event Type Information
    pub event_type: String,
    pub event_version: i32,

    // Event Payload
    pub event_data: E,

    // Causation & Correlation
    pub causation_id: Option<Uuid>,
    pub correlation_id: Uuid,

    // Timing
    pub timestamp: DateTime<Utc>,

    pub metadata: HashMap<String, String>,
}

impl<E: DomainEvent> EventEnvelope<E> {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence_number: u64,
        event_data: E,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            sequence_number,
            event_type: event_data.event_type().to_string(),
            event_version: event_data.event_version(),
            event_data,
            causation_id: None,
            correlation_id,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_sequenced(&self) -> bool {
        self.sequence_number != 0
    }
}

// ============================================================================
// Domain Event Trait
// ============================================================================

/// All domain events must implement this trait to be used with the engine.
///
/// Implementors are usually a tagged enum over every event kind of one
/// aggregate; `event_type` returns the tag of the variant at hand.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    fn event_version(&self) -> i32 {
        1
    }

    /// Every tag this deployment can deserialize.
    fn known_event_types() -> &'static [&'static str]
    where
        Self: Sized;

    /// Shape of the payload stored under `event_type`, if described.
    fn describe_event(_event_type: &str) -> Option<TypeDescriptor>
    where
        Self: Sized,
    {
        None
    }
}

/// One concrete event kind inside a [`DomainEvent`] union.
///
/// Lets handlers be registered against the payload type instead of matching
/// on the whole union.
pub trait EventVariant<E>: Sized + 'static {
    const EVENT_TYPE: &'static str;

    fn extract(event: &E) -> Option<&Self>;
}

// ============================================================================
// Replay Ordering
// ============================================================================

/// Put events in replay order.
///
/// Sequenced events are authoritative: they keep ascending sequence order
/// among themselves. Unsequenced events (sequence 0) are ordered by
/// `timestamp` and merged in front of the first sequenced event that happened
/// after them.
pub fn order_for_replay<E>(events: Vec<EventEnvelope<E>>) -> Vec<EventEnvelope<E>> {
    let (mut sequenced, mut unsequenced): (Vec<_>, Vec<_>) =
        events.into_iter().partition(|e| e.is_sequenced());

    if unsequenced.is_empty() {
        sequenced.sort_by_key(|e| e.sequence_number);
        return sequenced;
    }

    unsequenced.sort_by_key(|e| e.timestamp);
    if sequenced.is_empty() {
        return unsequenced;
    }

    sequenced.sort_by_key(|e| e.sequence_number);

    let mut ordered = Vec::with_capacity(sequenced.len() + unsequenced.len());
    let mut seq_iter = sequenced.into_iter().peekable();
    let mut unseq_iter = unsequenced.into_iter().peekable();

    loop {
        let take_unsequenced = match (seq_iter.peek(), unseq_iter.peek()) {
            (Some(s), Some(u)) => u.timestamp < s.timestamp,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => break,
        };

        let next = if take_unsequenced { unseq_iter.next() } else { seq_iter.next() };
        ordered.extend(next);
    }

    ordered
}

// ============================================================================
// Tests
// ============================================================================
