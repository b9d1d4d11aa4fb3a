//! Domain events
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::aggregates::ShipmentStatus;
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderCreated { order_id: Uuid, code: String, user_id: Uuid, sub_order_ids: Vec<Uuid>, grand_total: Money },
    SubOrderCancelled { sub_order_id: Uuid, order_id: Uuid },
    ShipmentStatusChanged { shipment_id: Uuid, sub_order_id: Uuid, from: ShipmentStatus, to: ShipmentStatus, carrier_status_code: Option<i32> },
    PaymentCompleted { payment_id: Uuid, order_id: Uuid, amount: Money },
    SettlementCreated { settlement_id: Uuid, store_id: Uuid, net_amount: Money, item_count: usize },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderCreated { .. } => "order_created",
            Self::SubOrderCancelled { .. } => "sub_order_cancelled",
            Self::ShipmentStatusChanged { .. } => "shipment_status_changed",
            Self::PaymentCompleted { .. } => "payment_completed",
            Self::SettlementCreated { .. } => "settlement_created",
        }
    }

    /// NATS subject the event is published on.
    pub fn subject(&self) -> String { format!("marketplace.{}", self.kind()) }
}
