// ============================================================================
// scylla_event_engine
// ============================================================================
//
// Event-sourced aggregate engine:
// - event_sourcing::core   envelopes, serializer, aggregate state, snapshots
// - event_sourcing::store  store port, ScyllaDB and in-memory backends, repository
// - domain                 the Order aggregate built on top of it
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod event_sourcing;
pub mod metrics;
pub mod utils;

pub use config::EngineConfig;
