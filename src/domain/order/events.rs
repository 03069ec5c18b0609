use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::event_sourcing::core::{field, Describe, DomainEvent, EventUpcaster, EventVariant, TypeDescriptor};
use super::value_objects::OrderItem;

// ============================================================================
// Order Events - Domain Events for Order Aggregate
// ============================================================================

/// Order Event - Union type for all order events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    Created(OrderCreated),
    ItemsUpdated(OrderItemsUpdated),
    Confirmed(OrderConfirmed),
    Shipped(OrderShipped),
    Delivered(OrderDelivered),
    Cancelled(OrderCancelled),
}

// One tag per payload type; the tag is what gets stored as event_type.
macro_rules! order_events {
    ($($variant:ident => $payload:ident),* $(,)?) => {
        impl DomainEvent for OrderEvent {
            fn event_type(&self) -> &'static str {
                match self {
                    $(OrderEvent::$variant(_) => stringify!($payload),)*
                }
            }

            fn event_version(&self) -> i32 {
                match self {
                    OrderEvent::Shipped(_) => OrderShipped::VERSION,
                    _ => 1,
                }
            }

            fn known_event_types() -> &'static [&'static str] {
                &[$(stringify!($payload)),*]
            }

            fn describe_event(event_type: &str) -> Option<TypeDescriptor> {
                match event_type {
                    $(stringify!($payload) => Some($payload::descriptor()),)*
                    _ => None,
                }
            }
        }

        $(
            impl EventVariant<OrderEvent> for $payload {
                const EVENT_TYPE: &'static str = stringify!($payload);

                fn extract(event: &OrderEvent) -> Option<&Self> {
                    match event {
                        OrderEvent::$variant(e) => Some(e),
                        _ => None,
                    }
                }
            }
        )*
    };
}

order_events!(
    Created => OrderCreated,
    ItemsUpdated => OrderItemsUpdated,
    Confirmed => OrderConfirmed,
    Shipped => OrderShipped,
    Delivered => OrderDelivered,
    Cancelled => OrderCancelled,
);

// ============================================================================
// Individual Event Types
// ============================================================================

/// Order Created - Initial event in order lifecycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCreated {
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
}

impl Describe for OrderCreated {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object(
            "OrderCreated",
            vec![field::<Uuid>("customer_id"), field::<Vec<OrderItem>>("items")],
        )
    }
}

/// Order Items Updated - Order contents modified
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderItemsUpdated {
    pub items: Vec<OrderItem>,
    pub reason: Option<String>,
}

impl Describe for OrderItemsUpdated {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object(
            "OrderItemsUpdated",
            vec![field::<Vec<OrderItem>>("items"), field::<Option<String>>("reason")],
        )
    }
}

/// Order Cancelled - Order lifecycle ended
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCancelled {
    pub reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
}

impl Describe for OrderCancelled {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object(
            "OrderCancelled",
            vec![field::<Option<String>>("reason"), field::<Option<Uuid>>("cancelled_by")],
        )
    }
}

/// Order Confirmed - Order accepted for fulfillment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderConfirmed {
    pub confirmed_at: DateTime<Utc>,
}

impl Describe for OrderConfirmed {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object("OrderConfirmed", vec![field::<DateTime<Utc>>("confirmed_at")])
    }
}

/// Order Shipped - Order dispatched to customer
///
/// Version 1 stored the carrier under `shipper`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderShipped {
    pub tracking_number: String,
    pub carrier: String,
    pub shipped_at: DateTime<Utc>,
}

impl OrderShipped {
    pub const VERSION: i32 = 2;
}

impl Describe for OrderShipped {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object(
            "OrderShipped",
            vec![
                field::<String>("tracking_number"),
                field::<String>("carrier"),
                field::<DateTime<Utc>>("shipped_at"),
            ],
        )
    }
}

/// Order Delivered - Order successfully delivered
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderDelivered {
    pub delivered_at: DateTime<Utc>,
    pub signature: Option<String>,
}

impl Describe for OrderDelivered {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::object(
            "OrderDelivered",
            vec![field::<DateTime<Utc>>("delivered_at"), field::<Option<String>>("signature")],
        )
    }
}

// ============================================================================
// Upcasters
// ============================================================================

/// Renames `shipper` to `carrier` in version 1 OrderShipped payloads.
pub struct OrderShippedV1Upcaster;

impl EventUpcaster for OrderShippedV1Upcaster {
    fn target_version(&self) -> i32 {
        OrderShipped::VERSION
    }

    fn upcast(&self, _from_version: i32, event_json: &str) -> anyhow::Result<String> {
        let mut value: serde_json::Value = serde_json::from_str(event_json)?;
        let data = value
            .get_mut("data")
            .and_then(|d| d.as_object_mut())
            .ok_or_else(|| anyhow::anyhow!("OrderShipped payload has no data object"))?;

        if let Some(shipper) = data.remove("shipper") {
            data.insert("carrier".to_string(), shipper);
        }
        Ok(value.to_string())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{AggregateId, EventEnvelope, EventSerializer, JsonEventSerializer, StoredEvent};
    use std::sync::Arc;

    #[test]
    fn test_event_type_tags() {
        let event = OrderEvent::Confirmed(OrderConfirmed { confirmed_at: Utc::now() });
        assert_eq!(event.event_type(), "OrderConfirmed");
        assert_eq!(event.event_version(), 1);
        assert_eq!(OrderEvent::known_event_types().len(), 6);
        assert!(OrderEvent::known_event_types().contains(&"OrderShipped"));
        assert_eq!(<OrderCreated as EventVariant<OrderEvent>>::EVENT_TYPE, "OrderCreated");
    }

    #[test]
    fn test_extract_matches_only_own_variant() {
        let event = OrderEvent::Cancelled(OrderCancelled { reason: None, cancelled_by: None });
        assert!(OrderCancelled::extract(&event).is_some());
        assert!(OrderConfirmed::extract(&event).is_none());
    }

    #[test]
    fn test_describe_shape_of_order_created() {
        let serializer = JsonEventSerializer::new();
        let shape = serializer.describe_shape::<OrderEvent>("OrderCreated").unwrap();

        let items = shape.property("items").unwrap();
        assert!(!items.is_primitive);
        assert!(shape.property("customer_id").unwrap().is_primitive);
    }

    #[test]
    fn test_v1_shipped_payload_is_upcast() {
        let serializer = JsonEventSerializer::new()
            .with_upcaster("OrderShipped", Arc::new(OrderShippedV1Upcaster));

        let stored = StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::new("o1"),
            aggregate_type: "Order".to_string(),
            sequence_number: 3,
            event_type: "OrderShipped".to_string(),
            event_version: 1,
            payload: r#"{"type":"Shipped","data":{"tracking_number":"TN1","shipper":"DHL","shipped_at":"2024-01-01T00:00:00Z"}}"#.to_string(),
            metadata: String::new(),
            causation_id: None,
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };

        let envelope: EventEnvelope<OrderEvent> = serializer.deserialize(&stored).unwrap();
        match envelope.event_data {
            OrderEvent::Shipped(e) => assert_eq!(e.carrier, "DHL"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(envelope.event_version, OrderShipped::VERSION);
    }
}
