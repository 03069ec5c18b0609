use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use anyhow::Result;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::errors::{EngineError, EngineResult};
use super::event::{AggregateId, DomainEvent, EventEnvelope};
use super::metadata::{EventMetadata, ShapeCache};

// ============================================================================
// Stored Event - storage-neutral row shape
// ============================================================================
//
// What every backend persists per event. Payload and metadata are already
// encoded by the serializer; backends never look inside them.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub event_type: String,
    pub event_version: i32,
    pub payload: String,
    pub metadata: String,
    pub causation_id: Option<Uuid>,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Event Serializer Contract
// ============================================================================

pub trait EventSerializer: Send + Sync + 'static {
    /// Encoding name, recorded for diagnostics.
    fn format(&self) -> &'static str;

    /// Encode the payload of one event. Fails if the payload is unrepresentable.
    fn serialize_payload<E: DomainEvent>(&self, event: &E) -> EngineResult<String>;

    /// Decode a payload stored under `declared_type` at `version`.
    ///
    /// Returns `UnknownEventType` when the tag is no longer known, so stream
    /// readers can skip the event instead of failing the whole read.
    fn deserialize_payload<E: DomainEvent>(
        &self,
        payload: &str,
        declared_type: &str,
        version: i32,
    ) -> EngineResult<E>;

    /// Structural description of the payload stored under `event_type`.
    fn describe_shape<E: DomainEvent>(&self, event_type: &str) -> EngineResult<Arc<EventMetadata>>;

    fn serialize_state<S: Serialize>(&self, state: &S) -> EngineResult<String>;

    fn deserialize_state<S: DeserializeOwned>(&self, payload: &str) -> EngineResult<S>;

    fn serialize<E: DomainEvent>(&self, envelope: &EventEnvelope<E>) -> EngineResult<StoredEvent> {
        Ok(StoredEvent {
            event_id: envelope.event_id,
            aggregate_id: envelope.aggregate_id.clone(),
            aggregate_type: envelope.aggregate_type.clone(),
            sequence_number: envelope.sequence_number,
            event_type: envelope.event_type.clone(),
            event_version: envelope.event_version,
            payload: self.serialize_payload(&envelope.event_data)?,
            metadata: serde_json::to_string(&envelope.metadata)?,
            causation_id: envelope.causation_id,
            correlation_id: envelope.correlation_id,
            timestamp: envelope.timestamp,
        })
    }

    fn deserialize<E: DomainEvent>(&self, stored: &StoredEvent) -> EngineResult<EventEnvelope<E>> {
        let event_data: E =
            self.deserialize_payload(&stored.payload, &stored.event_type, stored.event_version)?;

        let metadata: HashMap<String, String> = if stored.metadata.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&stored.metadata)?
        };

        Ok(EventEnvelope {
            event_id: stored.event_id,
            aggregate_id: stored.aggregate_id.clone(),
            aggregate_type: stored.aggregate_type.clone(),
            sequence_number: stored.sequence_number,
            event_type: stored.event_type.clone(),
            event_version: event_data.event_version(),
            event_data,
            causation_id: stored.causation_id,
            correlation_id: stored.correlation_id,
            timestamp: stored.timestamp,
            metadata,
        })
    }
}

// ============================================================================
// Event Versioning Support
// ============================================================================

/// Upcaster trait for evolving event schemas
pub trait EventUpcaster: Send + Sync {
    /// Version the upcaster produces.
    fn target_version(&self) -> i32;

    fn upcast(&self, from_version: i32, event_json: &str) -> Result<String>;
}

// ============================================================================
// JSON Serializer
// ============================================================================

#[derive(Default)]
pub struct JsonEventSerializer {
    shapes: ShapeCache,
    upcasters: HashMap<String, Arc<dyn EventUpcaster>>,
}

impl JsonEventSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upcaster(mut self, event_type: &str, upcaster: Arc<dyn EventUpcaster>) -> Self {
        self.upcasters.insert(event_type.to_string(), upcaster);
        self
    }

    pub fn cached_shapes(&self) -> usize {
        self.shapes.len()
    }

    fn upcast<'a>(
        &self,
        payload: &'a str,
        declared_type: &str,
        version: i32,
    ) -> EngineResult<std::borrow::Cow<'a, str>> {
        match self.upcasters.get(declared_type) {
            Some(upcaster) if version < upcaster.target_version() => {
                tracing::debug!(
                    event_type = declared_type,
                    from_version = version,
                    to_version = upcaster.target_version(),
                    "Upcasting stored event"
                );
                let upcasted = upcaster
                    .upcast(version, payload)
                    .map_err(|e| EngineError::Serialization(format!("upcast of {declared_type} failed: {e}")))?;
                Ok(std::borrow::Cow::Owned(upcasted))
            }
            _ => Ok(std::borrow::Cow::Borrowed(payload)),
        }
    }
}

impl EventSerializer for JsonEventSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn serialize_payload<E: DomainEvent>(&self, event: &E) -> EngineResult<String> {
        let value = serde_json::to_value(event)?;
        if value.is_null() {
            return Err(EngineError::Serialization(format!(
                "{} payload serialized to null",
                event.event_type()
            )));
        }
        Ok(value.to_string())
    }

    fn deserialize_payload<E: DomainEvent>(
        &self,
        payload: &str,
        declared_type: &str,
        version: i32,
    ) -> EngineResult<E> {
        if !E::known_event_types().contains(&declared_type) {
            return Err(EngineError::UnknownEventType(declared_type.to_string()));
        }

        let payload = self.upcast(payload, declared_type, version)?;
        let event: E = serde_json::from_str(&payload)?;

        if event.event_type() != declared_type {
            return Err(EngineError::Serialization(format!(
                "payload carries {} but was stored as {}",
                event.event_type(),
                declared_type
            )));
        }

        Ok(event)
    }

    fn describe_shape<E: DomainEvent>(&self, event_type: &str) -> EngineResult<Arc<EventMetadata>> {
        self.shapes.get_or_try_insert(TypeId::of::<E>(), event_type, || {
            if !E::known_event_types().contains(&event_type) {
                return Err(EngineError::UnknownEventType(event_type.to_string()));
            }
            let descriptor = E::describe_event(event_type).ok_or_else(|| {
                EngineError::Serialization(format!("no shape description for {event_type}"))
            })?;
            EventMetadata::from_descriptor(event_type, &descriptor)
        })
    }

    fn serialize_state<S: Serialize>(&self, state: &S) -> EngineResult<String> {
        Ok(serde_json::to_string(state)?)
    }

    fn deserialize_state<S: DeserializeOwned>(&self, payload: &str) -> EngineResult<S> {
        Ok(serde_json::from_str(payload)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::metadata::{field, Describe, TypeDescriptor};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Renamed {
        display_name: String,
    }

    impl Describe for Renamed {
        fn descriptor() -> TypeDescriptor {
            TypeDescriptor::object("Renamed", vec![field::<String>("display_name")])
        }
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "type", content = "data")]
    enum ProfileEvent {
        Renamed(Renamed),
        Closed,
    }

    impl DomainEvent for ProfileEvent {
        fn event_type(&self) -> &'static str {
            match self {
                ProfileEvent::Renamed(_) => "Renamed",
                ProfileEvent::Closed => "Closed",
            }
        }

        fn event_version(&self) -> i32 {
            2
        }

        fn known_event_types() -> &'static [&'static str] {
            &["Renamed", "Closed"]
        }

        fn describe_event(event_type: &str) -> Option<TypeDescriptor> {
            match event_type {
                "Renamed" => Some(Renamed::descriptor()),
                _ => None,
            }
        }
    }

    struct NameFieldUpcaster;

    impl EventUpcaster for NameFieldUpcaster {
        fn target_version(&self) -> i32 {
            2
        }

        fn upcast(&self, _from_version: i32, event_json: &str) -> Result<String> {
            let mut value: serde_json::Value = serde_json::from_str(event_json)?;
            if let Some(name) = value["data"].as_object_mut().and_then(|d| d.remove("name")) {
                value["data"]["display_name"] = name;
            }
            Ok(value.to_string())
        }
    }

    fn stored(payload: &str, event_type: &str, version: i32) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::new("p1"),
            aggregate_type: "Profile".to_string(),
            sequence_number: 1,
            event_type: event_type.to_string(),
            event_version: version,
            payload: payload.to_string(),
            metadata: "{}".to_string(),
            causation_id: None,
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_envelope_survives_storage_encoding() {
        let serializer = JsonEventSerializer::new();
        let envelope = EventEnvelope::new(
            AggregateId::new("p1"),
            "Profile",
            4,
            ProfileEvent::Renamed(Renamed { display_name: "Ada".to_string() }),
            Uuid::new_v4(),
        )
        .with_metadata("tenant".to_string(), "acme".to_string());

        let row = serializer.serialize(&envelope).unwrap();
        assert_eq!(row.event_type, "Renamed");
        assert!(row.payload.contains("Ada"));

        let back: EventEnvelope<ProfileEvent> = serializer.deserialize(&row).unwrap();
        assert_eq!(back.event_data, envelope.event_data);
        assert_eq!(back.sequence_number, 4);
        assert_eq!(back.metadata.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_unknown_type_is_reported_distinctly() {
        let serializer = JsonEventSerializer::new();
        let row = stored(r#"{"type":"Archived","data":{}}"#, "Archived", 1);

        let err = serializer.deserialize::<ProfileEvent>(&row).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEventType(t) if t == "Archived"));
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let serializer = JsonEventSerializer::new();
        let row = stored(r#"{"type":"Renamed","data":"#, "Renamed", 2);

        let err = serializer.deserialize::<ProfileEvent>(&row).unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }

    #[test]
    fn test_tag_mismatch_is_rejected() {
        let serializer = JsonEventSerializer::new();
        let row = stored(r#"{"type":"Closed"}"#, "Renamed", 2);

        let err = serializer.deserialize::<ProfileEvent>(&row).unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }

    #[test]
    fn test_upcaster_runs_for_older_versions_only() {
        let serializer = JsonEventSerializer::new().with_upcaster("Renamed", Arc::new(NameFieldUpcaster));

        let v1 = stored(r#"{"type":"Renamed","data":{"name":"Grace"}}"#, "Renamed", 1);
        let event: EventEnvelope<ProfileEvent> = serializer.deserialize(&v1).unwrap();
        assert_eq!(event.event_data, ProfileEvent::Renamed(Renamed { display_name: "Grace".to_string() }));

        let v2 = stored(r#"{"type":"Renamed","data":{"display_name":"Linus"}}"#, "Renamed", 2);
        let event: EventEnvelope<ProfileEvent> = serializer.deserialize(&v2).unwrap();
        assert_eq!(event.event_data, ProfileEvent::Renamed(Renamed { display_name: "Linus".to_string() }));
    }

    #[test]
    fn test_describe_shape_is_cached_per_serializer() {
        let serializer = JsonEventSerializer::new();
        let first = serializer.describe_shape::<ProfileEvent>("Renamed").unwrap();
        let second = serializer.describe_shape::<ProfileEvent>("Renamed").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.properties[0].name, "display_name");
        assert_eq!(serializer.cached_shapes(), 1);

        // a fresh serializer starts with its own empty cache
        assert_eq!(JsonEventSerializer::new().cached_shapes(), 0);
    }

    #[test]
    fn test_describe_shape_of_unknown_type_fails() {
        let serializer = JsonEventSerializer::new();
        let err = serializer.describe_shape::<ProfileEvent>("Deleted").unwrap_err();
        assert!(matches!(err, EngineError::UnknownEventType(_)));

        let err = serializer.describe_shape::<ProfileEvent>("Closed").unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }

    #[test]
    fn test_unrepresentable_payload_fails() {
        // JSON object keys must be strings
        #[derive(Serialize, Deserialize, Clone, Debug)]
        struct Keyed {
            entries: HashMap<(u8, u8), u8>,
        }

        impl DomainEvent for Keyed {
            fn event_type(&self) -> &'static str {
                "Keyed"
            }

            fn known_event_types() -> &'static [&'static str] {
                &["Keyed"]
            }
        }

        let serializer = JsonEventSerializer::new();
        let mut entries = HashMap::new();
        entries.insert((1, 2), 3);

        let err = serializer.serialize_payload(&Keyed { entries }).unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
