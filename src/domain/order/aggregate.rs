use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::event_sourcing::core::{Aggregate, EngineResult, HandlerRegistry};
use super::value_objects::{OrderItem, OrderStatus};
use super::events::*;
use super::commands::OrderCommand;
use super::errors::OrderError;

// ============================================================================
// Order Aggregate - Domain Logic
// ============================================================================
//
// State is only ever changed by the handlers registered below. Handlers read
// nothing but the event payload, so replaying a stream always yields the same
// order.
//
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderAggregate {
    // Current State (derived from events)
    pub customer_id: Option<Uuid>,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,

    // Lifecycle timestamps carried by events
    pub confirmed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,

    // Optional fields
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub cancelled_reason: Option<String>,
}

impl OrderAggregate {
    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|i| i.quantity as i64).sum()
    }

    /// Validate business rules before emitting events
    fn validate_items(&self, items: &[OrderItem]) -> Result<(), OrderError> {
        if items.is_empty() {
            return Err(OrderError::EmptyItems);
        }

        for item in items {
            if item.quantity <= 0 {
                return Err(OrderError::InvalidQuantity(item.quantity));
            }
        }

        Ok(())
    }

    fn on_created(&mut self, e: &OrderCreated) {
        self.customer_id = Some(e.customer_id);
        self.items = e.items.clone();
        self.status = OrderStatus::Created;
    }

    fn on_items_updated(&mut self, e: &OrderItemsUpdated) {
        self.items = e.items.clone();
    }

    fn on_confirmed(&mut self, e: &OrderConfirmed) {
        self.status = OrderStatus::Confirmed;
        self.confirmed_at = Some(e.confirmed_at);
    }

    fn on_shipped(&mut self, e: &OrderShipped) {
        self.status = OrderStatus::Shipped;
        self.tracking_number = Some(e.tracking_number.clone());
        self.carrier = Some(e.carrier.clone());
        self.shipped_at = Some(e.shipped_at);
    }

    fn on_delivered(&mut self, e: &OrderDelivered) {
        self.status = OrderStatus::Delivered;
        self.delivered_at = Some(e.delivered_at);
    }

    fn on_cancelled(&mut self, e: &OrderCancelled) {
        self.status = OrderStatus::Cancelled;
        self.cancelled_reason = e.reason.clone();
    }
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for OrderAggregate {
    const AGGREGATE_TYPE: &'static str = "Order";

    type Event = OrderEvent;
    type Command = OrderCommand;
    type Error = OrderError;

    fn register_handlers(registry: &mut HandlerRegistry<Self, Self::Event>) -> EngineResult<()> {
        registry
            .on::<OrderCreated>(Self::on_created)?
            .on::<OrderItemsUpdated>(Self::on_items_updated)?
            .on::<OrderConfirmed>(Self::on_confirmed)?
            .on::<OrderShipped>(Self::on_shipped)?
            .on::<OrderDelivered>(Self::on_delivered)?
            .on::<OrderCancelled>(Self::on_cancelled)?;
        Ok(())
    }

    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if self.status == OrderStatus::Draft && !matches!(command, OrderCommand::CreateOrder { .. }) {
            return Err(OrderError::NotCreated);
        }

        match command {
            OrderCommand::CreateOrder { customer_id, items } => {
                if self.status != OrderStatus::Draft {
                    return Err(OrderError::AlreadyCreated);
                }
                self.validate_items(items)?;

                Ok(vec![OrderEvent::Created(OrderCreated {
                    customer_id: *customer_id,
                    items: items.clone(),
                })])
            }

            OrderCommand::UpdateItems { items, reason } => {
                // Validate status
                match self.status {
                    OrderStatus::Cancelled => return Err(OrderError::AlreadyCancelled),
                    OrderStatus::Created => {} // OK
                    other => return Err(OrderError::InvalidStatusTransition(other)),
                }

                self.validate_items(items)?;

                Ok(vec![OrderEvent::ItemsUpdated(OrderItemsUpdated {
                    items: items.clone(),
                    reason: reason.clone(),
                })])
            }

            OrderCommand::ConfirmOrder => {
                match self.status {
                    OrderStatus::Created => {}
                    OrderStatus::Confirmed => return Err(OrderError::AlreadyConfirmed),
                    other => return Err(OrderError::InvalidStatusTransition(other)),
                }

                Ok(vec![OrderEvent::Confirmed(OrderConfirmed {
                    confirmed_at: Utc::now(),
                })])
            }

            OrderCommand::ShipOrder { tracking_number, carrier } => {
                match self.status {
                    OrderStatus::Confirmed => {}
                    OrderStatus::Created => return Err(OrderError::NotConfirmed),
                    other => return Err(OrderError::InvalidStatusTransition(other)),
                }

                Ok(vec![OrderEvent::Shipped(OrderShipped {
                    tracking_number: tracking_number.clone(),
                    carrier: carrier.clone(),
                    shipped_at: Utc::now(),
                })])
            }

            OrderCommand::DeliverOrder { signature } => {
                if self.status != OrderStatus::Shipped {
                    return Err(OrderError::NotShipped);
                }

                Ok(vec![OrderEvent::Delivered(OrderDelivered {
                    delivered_at: Utc::now(),
                    signature: signature.clone(),
                })])
            }

            OrderCommand::CancelOrder { reason, cancelled_by } => {
                match self.status {
                    OrderStatus::Cancelled => return Err(OrderError::AlreadyCancelled),
                    OrderStatus::Delivered => {
                        return Err(OrderError::InvalidStatusTransition(self.status))
                    }
                    _ => {} // Can cancel from Created, Confirmed, or Shipped
                }

                Ok(vec![OrderEvent::Cancelled(OrderCancelled {
                    reason: reason.clone(),
                    cancelled_by: *cancelled_by,
                })])
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
