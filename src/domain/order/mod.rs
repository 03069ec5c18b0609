// ============================================================================
// Order Domain - Business Logic for Order Aggregate
// ============================================================================
//
// This module contains ALL Order-specific code:
// - Value objects (OrderItem, OrderStatus)
// - Events (OrderCreated, OrderConfirmed, etc.) and their upcasters
// - Commands (CreateOrder, ConfirmOrder, etc.)
// - Errors (OrderError enum)
// - Aggregate (OrderAggregate: handlers and business rules)
// - Command Handler (OrderCommandHandler: rehydrate, decide, commit)
//
// It only talks to the engine through the Aggregate trait and the Repository.
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod commands;
pub mod errors;
pub mod aggregate;
pub mod command_handler;

// Re-export for convenience
pub use value_objects::*;
pub use events::*;
pub use commands::*;
pub use errors::*;
pub use aggregate::*;
pub use command_handler::*;
