use uuid::Uuid;
use super::value_objects::OrderItem;

// ============================================================================
// Order Commands - Represent user intent
// ============================================================================

#[derive(Debug, Clone)]
pub enum OrderCommand {
    CreateOrder {
        customer_id: Uuid,
        items: Vec<OrderItem>,
    },
    UpdateItems {
        items: Vec<OrderItem>,
        reason: Option<String>,
    },
    ConfirmOrder,
    ShipOrder {
        tracking_number: String,
        carrier: String,
    },
    DeliverOrder {
        signature: Option<String>,
    },
    CancelOrder {
        reason: Option<String>,
        cancelled_by: Option<Uuid>,
    },
}

impl OrderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OrderCommand::CreateOrder { .. } => "CreateOrder",
            OrderCommand::UpdateItems { .. } => "UpdateItems",
            OrderCommand::ConfirmOrder => "ConfirmOrder",
            OrderCommand::ShipOrder { .. } => "ShipOrder",
            OrderCommand::DeliverOrder { .. } => "DeliverOrder",
            OrderCommand::CancelOrder { .. } => "CancelOrder",
        }
    }
}
