use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_sourcing::core::{field, Describe, TypeDescriptor};

// ============================================================================
// Order Value Objects
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

impl Describe for OrderItem {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object(
            "OrderItem",
            vec![field::<Uuid>("product_id"), field::<i32>("quantity")],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderStatus {
    /// No OrderCreated event applied yet
    #[default]
    Draft,
    Created,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_item_creation() {
        let product_id = Uuid::new_v4();
        let item = OrderItem {
            product_id,
            quantity: 5,
        };

        assert_eq!(item.product_id, product_id);
        assert_eq!(item.quantity, 5);
    }

    #[test]
    fn test_order_status_defaults_to_draft() {
        assert_eq!(OrderStatus::default(), OrderStatus::Draft);
        assert!(!OrderStatus::Draft.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Delivered.is_terminal());
    }

    #[test]
    fn test_order_status_serialization() {
        let status = OrderStatus::Shipped;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"Shipped\"");
        let deserialized: OrderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }

    #[test]
    fn test_order_item_shape() {
        let descriptor = OrderItem::descriptor();
        assert_eq!(descriptor.name, "OrderItem");
        assert!(!descriptor.is_primitive());
    }
}
