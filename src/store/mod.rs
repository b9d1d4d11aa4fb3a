//! Persistence ports and their two implementations.
//!
//! Every method that changes more than one row is atomic: the Postgres store runs it
//! in one transaction with row locks, the memory store under one mutex guard.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use crate::domain::aggregates::{
    Address, Cart, CarrierOrder, CarrierUpdate, CheckoutPlan, EligibleSubOrder, GatewayConfirmation, Order, OrderItem,
    Payment, PaymentOutcome, Refund, Settlement, SettlementItem, SettlementPeriod, Shipment, ShipmentUpdateOutcome,
    SubOrder, Variant, Voucher, VoucherReservation,
};
use crate::domain::value_objects::{Money, VoucherCode};
use crate::Result;

// =============================================================================
// Read models
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubOrderDetail {
    pub sub_order: SubOrder,
    pub items: Vec<OrderItem>,
    pub shipment: Shipment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OrderDetail {
    pub order: Order,
    pub sub_orders: Vec<SubOrderDetail>,
    pub payment: Payment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SettlementDetail {
    pub settlement: Settlement,
    pub items: Vec<SettlementItem>,
    pub refunds: Vec<Refund>,
}

/// Result of cancelling a sub-order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CancelledSubOrder {
    pub sub_order: SubOrder,
    pub shipment: Shipment,
    pub refund: Option<Refund>,
}

/// Result of applying one carrier update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppliedUpdate {
    pub outcome: ShipmentUpdateOutcome,
    pub shipment: Shipment,
    /// Set when the update collected a COD payment.
    pub payment_completed: Option<Payment>,
}

#[derive(Clone, Debug)]
pub struct ReservationRequest {
    pub code: VoucherCode,
    pub user_id: Uuid,
    /// Amount the voucher would discount: goods subtotal or shipping total.
    pub eligible_amount: Money,
    pub now: DateTime<Utc>,
    pub ttl: Duration,
}

// =============================================================================
// Repository traits
// =============================================================================

/// Catalog and address book, owned by other parts of the platform.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Variants with their current stock; unknown ids are skipped.
    async fn variants(&self, ids: &[Uuid]) -> Result<Vec<Variant>>;
    async fn user_address(&self, user_id: Uuid, address_id: Uuid) -> Result<Address>;
    async fn store_address(&self, store_id: Uuid) -> Result<Address>;
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn load_cart(&self, user_id: Uuid) -> Result<Cart>;
    async fn save_cart(&self, cart: &Cart) -> Result<()>;
}

#[async_trait]
pub trait VoucherRepository: Send + Sync {
    async fn create_voucher(&self, voucher: &Voucher) -> Result<()>;
    async fn voucher_by_code(&self, code: &VoucherCode) -> Result<Option<Voucher>>;
    /// Lock the voucher, count its usage and hold one slot for the user.
    async fn reserve_voucher(&self, request: &ReservationRequest) -> Result<VoucherReservation>;
    async fn reservation(&self, id: Uuid) -> Result<Option<(VoucherReservation, Voucher)>>;
    async fn release_reservation(&self, id: Uuid, user_id: Uuid) -> Result<VoucherReservation>;
    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Decrement stock, consume reservations and write every row of the plan, or nothing.
    async fn commit_checkout(&self, plan: &CheckoutPlan, now: DateTime<Utc>) -> Result<()>;
    async fn order_by_idempotency_key(&self, user_id: Uuid, key: &str) -> Result<Option<OrderDetail>>;
    async fn order_detail(&self, order_id: Uuid) -> Result<Option<OrderDetail>>;
    async fn sub_order(&self, id: Uuid) -> Result<Option<SubOrder>>;
    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<OrderDetail>>;
    async fn cancel_sub_order(&self, sub_order_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<CancelledSubOrder>;
}

#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    async fn shipment(&self, id: Uuid) -> Result<Option<Shipment>>;
    async fn shipment_by_label(&self, label: &str) -> Result<Option<Shipment>>;
    async fn shipment_for_sub_order(&self, sub_order_id: Uuid) -> Result<Option<Shipment>>;
    /// Shipments whose carrier order still has to be created.
    async fn shipments_awaiting_carrier(&self, limit: i64) -> Result<Vec<Shipment>>;
    /// Shipments with a label that have not reached a terminal state.
    async fn shipments_in_flight(&self, limit: i64) -> Result<Vec<Shipment>>;
    async fn record_carrier_order(&self, shipment_id: Uuid, order: &CarrierOrder, now: DateTime<Utc>) -> Result<Shipment>;
    async fn record_carrier_failure(&self, shipment_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;
    /// De-duplicate, transition the shipment and propagate to sub-order, order and payment.
    async fn apply_carrier_update(&self, shipment_id: Uuid, update: &CarrierUpdate, now: DateTime<Utc>) -> Result<AppliedUpdate>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn payment_by_txn_ref(&self, txn_ref: &str) -> Result<Option<Payment>>;
    async fn record_gateway_result(&self, confirmation: &GatewayConfirmation, now: DateTime<Utc>) -> Result<(Payment, PaymentOutcome)>;
}

#[async_trait]
pub trait SettlementRepository: Send + Sync {
    async fn eligible_sub_orders(&self, store_id: Uuid, period: &SettlementPeriod) -> Result<Vec<EligibleSubOrder>>;
    async fn create_settlement(&self, store_id: Uuid, period: &SettlementPeriod, commission_rate: Decimal, now: DateTime<Utc>) -> Result<SettlementDetail>;
    async fn settlement(&self, id: Uuid) -> Result<Option<SettlementDetail>>;
    async fn settlements_for_store(&self, store_id: Uuid) -> Result<Vec<Settlement>>;
    async fn mark_settlement_paid(&self, id: Uuid, reference: &str, now: DateTime<Utc>) -> Result<Settlement>;
    async fn cancel_settlement(&self, id: Uuid) -> Result<Settlement>;
    async fn request_refund(&self, sub_order_id: Uuid, amount: Money, reason: &str, now: DateTime<Utc>) -> Result<Refund>;
    async fn decide_refund(&self, refund_id: Uuid, approve: bool, now: DateTime<Utc>) -> Result<Refund>;
}

/// Everything the lifecycle persists.
pub trait Store:
    CatalogRepository + CartRepository + VoucherRepository + OrderRepository + ShipmentRepository + PaymentRepository + SettlementRepository
{
}

impl<T> Store for T where
    T: CatalogRepository + CartRepository + VoucherRepository + OrderRepository + ShipmentRepository + PaymentRepository + SettlementRepository
{
}

pub type DynStore = Arc<dyn Store>;
