//! Order Aggregate
//!
//! An order is split into one sub-order per store. Sub-orders carry their own money
//! breakdown so they can be shipped, cancelled and settled independently.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::payment::PaymentMethod;
use crate::domain::aggregates::variant::Address;
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub code: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub items_subtotal: Money,
    pub shipping_total: Money,
    pub discount_total: Money,
    pub grand_total: Money,
    pub payment_method: PaymentMethod,
    pub shipping_address: Address,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub status: SubOrderStatus,
    pub items_subtotal: Money,
    pub shipping_fee: Money,
    /// Funded by the store, deducted from its payout.
    pub store_discount: Money,
    /// Platform-funded discount on goods.
    pub platform_discount: Money,
    /// Platform-funded discount on shipping.
    pub shipping_discount: Money,
    pub total: Money,
    pub completed_at: Option<DateTime<Utc>>,
    pub settlement_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub sub_order_id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub line_total: Money,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] Pending, Processing, Completed, Cancelled }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubOrderStatus { #[default] Pending, Confirmed, Shipping, Delivered, Completed, Cancelled, Returned }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Processing => "processing", Self::Completed => "completed", Self::Cancelled => "cancelled" }
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(OrderError::Corrupt(format!("unknown order status {other}"))),
        }
    }
}

impl SubOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending", Self::Confirmed => "confirmed", Self::Shipping => "shipping",
            Self::Delivered => "delivered", Self::Completed => "completed", Self::Cancelled => "cancelled", Self::Returned => "returned",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Cancelled | Self::Returned) }
}

impl FromStr for SubOrderStatus {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "shipping" => Ok(Self::Shipping),
            "delivered" => Ok(Self::Delivered),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "returned" => Ok(Self::Returned),
            other => Err(OrderError::Corrupt(format!("unknown sub-order status {other}"))),
        }
    }
}

/// `ORD-` followed by eight uppercase hex digits.
pub fn generate_order_code() -> String {
    format!("ORD-{:08X}", rand::thread_rng().gen::<u32>())
}

/// Order status follows its sub-orders.
pub fn derive_order_status(statuses: &[SubOrderStatus]) -> OrderStatus {
    if statuses.is_empty() { return OrderStatus::Pending; }
    if statuses.iter().all(|s| *s == SubOrderStatus::Cancelled) { return OrderStatus::Cancelled; }
    if statuses.iter().all(SubOrderStatus::is_terminal) {
        return if statuses.contains(&SubOrderStatus::Completed) { OrderStatus::Completed } else { OrderStatus::Cancelled };
    }
    if statuses.iter().any(|s| matches!(s, SubOrderStatus::Shipping | SubOrderStatus::Delivered | SubOrderStatus::Completed | SubOrderStatus::Returned)) {
        return OrderStatus::Processing;
    }
    OrderStatus::Pending
}

impl SubOrder {
    pub fn discount_total(&self) -> Money { self.store_discount + self.platform_discount + self.shipping_discount }

    /// Recompute `total` from the breakdown.
    pub fn recompute_total(&mut self) {
        self.total = (self.items_subtotal + self.shipping_fee).saturating_sub(self.discount_total());
    }

    /// Move to the status implied by the shipment. Returns `true` when it changed.
    pub fn follow_shipment(&mut self, next: SubOrderStatus, at: DateTime<Utc>) -> bool {
        if self.status == next || self.status.is_terminal() { return false; }
        self.status = next;
        if next == SubOrderStatus::Completed { self.completed_at = Some(at); }
        self.updated_at = at;
        true
    }

    pub fn ensure_refundable(&self) -> Result<(), OrderError> {
        match self.status {
            SubOrderStatus::Delivered | SubOrderStatus::Completed | SubOrderStatus::Returned => Ok(()),
            other => Err(OrderError::NotRefundable(other)),
        }
    }
}

impl Order {
    pub fn touch(&mut self, statuses: &[SubOrderStatus], at: DateTime<Utc>) -> bool {
        let next = derive_order_status(statuses);
        if next == self.status { return false; }
        self.status = next;
        self.updated_at = at;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("order not found")]
    NotFound,
    #[error("sub-order not found")]
    SubOrderNotFound,
    #[error("sub-order belongs to another user")]
    NotOwner,
    #[error("sub-order can no longer be cancelled (shipment is {0})")]
    NotCancellable(String),
    #[error("sub-order in status {0:?} cannot be refunded")]
    NotRefundable(SubOrderStatus),
    #[error("order code {0} is already taken")]
    DuplicateCode(String),
    #[error("corrupt order record: {0}")]
    Corrupt(String),
}
