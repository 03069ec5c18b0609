use super::value_objects::OrderStatus;
use crate::event_sourcing::core::EngineError;
use crate::utils::IsTransient;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order already exists")]
    AlreadyCreated,

    #[error("Order does not exist")]
    NotCreated,

    #[error("Order is already cancelled")]
    AlreadyCancelled,

    #[error("Order is already confirmed")]
    AlreadyConfirmed,

    #[error("Order must be confirmed before shipping")]
    NotConfirmed,

    #[error("Order must be shipped before delivery")]
    NotShipped,

    #[error("Cannot modify order in status: {0:?}")]
    InvalidStatusTransition(OrderStatus),

    #[error("Order items cannot be empty")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(i32),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IsTransient for OrderError {
    fn is_transient(&self) -> bool {
        matches!(self, OrderError::Engine(e) if e.is_transient())
    }
}
