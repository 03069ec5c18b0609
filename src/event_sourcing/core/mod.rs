// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Everything that does not touch storage:
// - event envelope, identity and replay ordering
// - payload serialization and shape metadata
// - aggregate state machine and handler dispatch
// - snapshot policy and archive behavior
//
// No domain-specific code lives here.
//
// ============================================================================

pub mod aggregate;
pub mod errors;
pub mod event;
pub mod metadata;
pub mod serializer;
pub mod snapshot;

// Re-export core types for convenience
pub use aggregate::{Aggregate, AggregateState, HandlerRegistry, StateFactory, UnhandledEventPolicy};
pub use errors::{EngineError, EngineResult};
pub use event::{order_for_replay, AggregateId, DomainEvent, EventEnvelope, EventVariant};
pub use metadata::{field, Describe, EventMetadata, PropertyMetadata, ShapeCache, TypeDescriptor};
pub use serializer::{EventSerializer, EventUpcaster, JsonEventSerializer, StoredEvent};
pub use snapshot::{ArchiveBehavior, NumericSnapshotBehavior, Snapshot, SnapshotBehavior, SnapshotCut};
