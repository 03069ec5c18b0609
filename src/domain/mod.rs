// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Concrete aggregates built on the event sourcing engine. Each one lives in
// its own subdirectory: value objects, events, commands, errors, the
// aggregate itself and a command handler.
//
// ============================================================================

pub mod order;
