// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// This module contains GENERIC persistence infrastructure for event sourcing.
// All components work with ANY aggregate/event type.
//
// ============================================================================

pub mod event_store;
pub mod memory;
pub mod repository;
pub mod scylla;

pub use event_store::EventStore;
pub use memory::InMemoryEventStore;
pub use repository::Repository;
pub use self::scylla::ScyllaEventStore;
