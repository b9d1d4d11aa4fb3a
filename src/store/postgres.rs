//! Postgres store.
//!
//! Rows are read with runtime `query_as` into `FromRow` structs and converted into
//! aggregates. Every multi-row change runs in one transaction; rows that decide an
//! outcome (stock, vouchers, shipments, payments, settleable sub-orders) are locked
//! with `FOR UPDATE` first. Lock order is shipment, order, sub-orders, payment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;
use crate::domain::aggregates::shipment::update_key;
use crate::domain::aggregates::voucher::usage_of;
use crate::domain::aggregates::{
    Address, Cart, CartLine, CarrierOrder, CarrierUpdate, CheckoutPlan, Discount, EligibleSubOrder, Fulfilment,
    GatewayConfirmation, Order, OrderError, OrderItem, Payment, PaymentError, PaymentOutcome, Refund, Settlement,
    SettlementError, SettlementItem, SettlementPeriod, Shipment, ShipmentError, ShipmentUpdateOutcome, StockError,
    SubOrder, TransitionEffects, Variant, Voucher, VoucherError, VoucherReservation,
};
use crate::domain::value_objects::{Money, VoucherCode};
use crate::{MarketplaceError, Result};
use super::{
    AppliedUpdate, CancelledSubOrder, CartRepository, CatalogRepository, OrderDetail, OrderRepository, PaymentRepository,
    ReservationRequest, SettlementDetail, SettlementRepository, ShipmentRepository, SubOrderDetail, VoucherRepository,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn log_db(context: &'static str) -> impl FnOnce(sqlx::Error) -> MarketplaceError {
    move |e| {
        error!("❌ {context}: {e:?}");
        MarketplaceError::Storage(e)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn violates(e: &sqlx::Error, constraint: &str) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation() && db.constraint() == Some(constraint))
}

fn to_u32(value: i32) -> u32 { u32::try_from(value).unwrap_or_default() }
fn to_i32(value: u32) -> i32 { i32::try_from(value).unwrap_or(i32::MAX) }

// =============================================================================
// Rows
// =============================================================================

#[derive(FromRow)]
struct VariantRow { id: Uuid, store_id: Uuid, product_name: String, sku: String, unit_price: i64, weight_grams: i32, stock: i32 }

impl From<VariantRow> for Variant {
    fn from(r: VariantRow) -> Self {
        Variant::new(r.id, r.store_id, r.product_name, r.sku, Money::vnd(r.unit_price), to_u32(r.weight_grams), to_u32(r.stock))
    }
}

#[derive(FromRow)]
struct VoucherRow {
    id: Uuid, code: String, scope: String, discount_type: String, discount_value: Decimal, max_discount: Option<i64>,
    min_order_value: i64, usage_limit: Option<i32>, per_user_limit: Option<i32>, store_id: Option<Uuid>,
    starts_at: DateTime<Utc>, ends_at: DateTime<Utc>, is_active: bool,
}

impl TryFrom<VoucherRow> for Voucher {
    type Error = VoucherError;
    fn try_from(r: VoucherRow) -> std::result::Result<Self, Self::Error> {
        let discount = match r.discount_type.as_str() {
            "percentage" => Discount::Percentage(r.discount_value),
            "fixed" => Discount::Fixed(Money::vnd(r.discount_value.to_i64().ok_or_else(|| VoucherError::Corrupt(format!("fixed discount {}", r.discount_value)))?)),
            other => return Err(VoucherError::Corrupt(format!("unknown discount type {other}"))),
        };
        Ok(Voucher {
            id: r.id, code: VoucherCode::new(r.code).map_err(|e| VoucherError::Corrupt(e.to_string()))?, scope: r.scope.parse()?,
            discount, max_discount: r.max_discount.map(Money::vnd), min_order_value: Money::vnd(r.min_order_value),
            usage_limit: r.usage_limit.map(to_u32), per_user_limit: r.per_user_limit.map(to_u32), store_id: r.store_id,
            starts_at: r.starts_at, ends_at: r.ends_at, is_active: r.is_active,
        })
    }
}

#[derive(FromRow)]
struct ReservationRow { id: Uuid, voucher_id: Uuid, user_id: Uuid, status: String, reserved_at: DateTime<Utc>, expires_at: DateTime<Utc>, order_id: Option<Uuid> }

impl TryFrom<ReservationRow> for VoucherReservation {
    type Error = VoucherError;
    fn try_from(r: ReservationRow) -> std::result::Result<Self, Self::Error> {
        Ok(VoucherReservation {
            id: r.id, voucher_id: r.voucher_id, user_id: r.user_id, status: r.status.parse()?,
            reserved_at: r.reserved_at, expires_at: r.expires_at, order_id: r.order_id,
        })
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid, code: String, user_id: Uuid, status: String, items_subtotal: i64, shipping_total: i64, discount_total: i64,
    grand_total: i64, payment_method: String, shipping_address: Json<Address>, note: Option<String>,
    idempotency_key: Option<String>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = MarketplaceError;
    fn try_from(r: OrderRow) -> Result<Self> {
        Ok(Order {
            id: r.id, code: r.code, user_id: r.user_id, status: r.status.parse()?,
            items_subtotal: Money::vnd(r.items_subtotal), shipping_total: Money::vnd(r.shipping_total),
            discount_total: Money::vnd(r.discount_total), grand_total: Money::vnd(r.grand_total),
            payment_method: r.payment_method.parse()?, shipping_address: r.shipping_address.0, note: r.note,
            idempotency_key: r.idempotency_key, created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SubOrderRow {
    id: Uuid, order_id: Uuid, store_id: Uuid, status: String, items_subtotal: i64, shipping_fee: i64, store_discount: i64,
    platform_discount: i64, shipping_discount: i64, total: i64, completed_at: Option<DateTime<Utc>>,
    settlement_id: Option<Uuid>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

impl TryFrom<SubOrderRow> for SubOrder {
    type Error = OrderError;
    fn try_from(r: SubOrderRow) -> std::result::Result<Self, Self::Error> {
        Ok(SubOrder {
            id: r.id, order_id: r.order_id, store_id: r.store_id, status: r.status.parse()?,
            items_subtotal: Money::vnd(r.items_subtotal), shipping_fee: Money::vnd(r.shipping_fee),
            store_discount: Money::vnd(r.store_discount), platform_discount: Money::vnd(r.platform_discount),
            shipping_discount: Money::vnd(r.shipping_discount), total: Money::vnd(r.total), completed_at: r.completed_at,
            settlement_id: r.settlement_id, created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EligibleRow {
    #[sqlx(flatten)]
    sub_order: SubOrderRow,
    order_code: String,
}

#[derive(FromRow)]
struct OrderItemRow { id: Uuid, sub_order_id: Uuid, variant_id: Uuid, product_name: String, sku: String, unit_price: i64, quantity: i32, line_total: i64 }

impl From<OrderItemRow> for OrderItem {
    fn from(r: OrderItemRow) -> Self {
        OrderItem {
            id: r.id, sub_order_id: r.sub_order_id, variant_id: r.variant_id, product_name: r.product_name, sku: r.sku,
            unit_price: Money::vnd(r.unit_price), quantity: to_u32(r.quantity), line_total: Money::vnd(r.line_total),
        }
    }
}

#[derive(FromRow)]
struct ShipmentRow {
    id: Uuid, sub_order_id: Uuid, carrier: String, label: Option<String>, status: String, fee: i64,
    carrier_status_code: Option<i32>, last_error: Option<String>, estimated_delivery: Option<String>,
    pickup_address: Json<Address>, delivery_address: Json<Address>, weight_grams: i32, cod_amount: i64,
    declared_value: i64, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

impl TryFrom<ShipmentRow> for Shipment {
    type Error = ShipmentError;
    fn try_from(r: ShipmentRow) -> std::result::Result<Self, Self::Error> {
        Ok(Shipment {
            id: r.id, sub_order_id: r.sub_order_id, carrier: r.carrier, label: r.label, status: r.status.parse()?,
            fee: Money::vnd(r.fee), carrier_status_code: r.carrier_status_code, last_error: r.last_error,
            estimated_delivery: r.estimated_delivery, pickup_address: r.pickup_address.0, delivery_address: r.delivery_address.0,
            weight_grams: to_u32(r.weight_grams), cod_amount: Money::vnd(r.cod_amount), declared_value: Money::vnd(r.declared_value),
            created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid, order_id: Uuid, method: String, status: String, amount: i64, txn_ref: String,
    gateway_transaction_no: Option<String>, failure_code: Option<String>, paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = PaymentError;
    fn try_from(r: PaymentRow) -> std::result::Result<Self, Self::Error> {
        Ok(Payment {
            id: r.id, order_id: r.order_id, method: r.method.parse()?, status: r.status.parse()?, amount: Money::vnd(r.amount),
            txn_ref: r.txn_ref, gateway_transaction_no: r.gateway_transaction_no, failure_code: r.failure_code,
            paid_at: r.paid_at, created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SettlementRow {
    id: Uuid, store_id: Uuid, period_start: DateTime<Utc>, period_end: DateTime<Utc>, status: String, gross_amount: i64,
    discount_amount: i64, commission_amount: i64, refund_amount: i64, net_amount: i64, commission_rate: Decimal,
    payout_reference: Option<String>, created_at: DateTime<Utc>, paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<SettlementRow> for Settlement {
    type Error = SettlementError;
    fn try_from(r: SettlementRow) -> std::result::Result<Self, Self::Error> {
        Ok(Settlement {
            id: r.id, store_id: r.store_id, period_start: r.period_start, period_end: r.period_end, status: r.status.parse()?,
            gross_amount: Money::vnd(r.gross_amount), discount_amount: Money::vnd(r.discount_amount),
            commission_amount: Money::vnd(r.commission_amount), refund_amount: Money::vnd(r.refund_amount),
            net_amount: Money::vnd(r.net_amount), commission_rate: r.commission_rate, payout_reference: r.payout_reference,
            created_at: r.created_at, paid_at: r.paid_at,
        })
    }
}

#[derive(FromRow)]
struct SettlementItemRow {
    id: Uuid, settlement_id: Uuid, sub_order_id: Uuid, order_code: String, items_subtotal: i64, store_discount: i64,
    commission: i64, net_amount: i64, completed_at: DateTime<Utc>,
}

impl From<SettlementItemRow> for SettlementItem {
    fn from(r: SettlementItemRow) -> Self {
        SettlementItem {
            id: r.id, settlement_id: r.settlement_id, sub_order_id: r.sub_order_id, order_code: r.order_code,
            items_subtotal: Money::vnd(r.items_subtotal), store_discount: Money::vnd(r.store_discount),
            commission: Money::vnd(r.commission), net_amount: Money::vnd(r.net_amount), completed_at: r.completed_at,
        }
    }
}

#[derive(FromRow)]
struct RefundRow {
    id: Uuid, sub_order_id: Uuid, store_id: Uuid, amount: i64, reason: String, status: String, chargeable_to_store: bool,
    settlement_id: Option<Uuid>, created_at: DateTime<Utc>, decided_at: Option<DateTime<Utc>>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = SettlementError;
    fn try_from(r: RefundRow) -> std::result::Result<Self, Self::Error> {
        Ok(Refund {
            id: r.id, sub_order_id: r.sub_order_id, store_id: r.store_id, amount: Money::vnd(r.amount), reason: r.reason,
            status: r.status.parse()?, chargeable_to_store: r.chargeable_to_store, settlement_id: r.settlement_id,
            created_at: r.created_at, decided_at: r.decided_at,
        })
    }
}

// =============================================================================
// Shared statements
// =============================================================================

async fn lock_shipment(conn: &mut PgConnection, sql: &str, key: Uuid) -> Result<Shipment> {
    let row = sqlx::query_as::<_, ShipmentRow>(sql).bind(key).fetch_optional(&mut *conn).await?;
    Ok(row.ok_or(ShipmentError::NotFound)?.try_into()?)
}

async fn update_shipment(conn: &mut PgConnection, s: &Shipment) -> Result<()> {
    sqlx::query("UPDATE shipments SET label = $2, status = $3, fee = $4, carrier_status_code = $5, last_error = $6, estimated_delivery = $7, updated_at = $8 WHERE id = $1")
        .bind(s.id).bind(&s.label).bind(s.status.as_str()).bind(s.fee.amount()).bind(s.carrier_status_code)
        .bind(&s.last_error).bind(&s.estimated_delivery).bind(s.updated_at)
        .execute(&mut *conn).await.map_err(log_db("Failed to update shipment"))?;
    Ok(())
}

async fn insert_refund(conn: &mut PgConnection, r: &Refund) -> Result<()> {
    sqlx::query("INSERT INTO refunds (id, sub_order_id, store_id, amount, reason, status, chargeable_to_store, settlement_id, created_at, decided_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)")
        .bind(r.id).bind(r.sub_order_id).bind(r.store_id).bind(r.amount.amount()).bind(&r.reason).bind(r.status.as_str())
        .bind(r.chargeable_to_store).bind(r.settlement_id).bind(r.created_at).bind(r.decided_at)
        .execute(&mut *conn).await.map_err(log_db("Failed to insert refund"))?;
    Ok(())
}

async fn load_payment(conn: &mut PgConnection, order_id: Uuid) -> Result<Payment> {
    let row = sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE order_id = $1 FOR UPDATE")
        .bind(order_id).fetch_optional(&mut *conn).await?;
    Ok(row.ok_or(MarketplaceError::NotFound("payment"))?.try_into()?)
}

async fn update_payment(conn: &mut PgConnection, p: &Payment) -> Result<()> {
    sqlx::query("UPDATE payments SET status = $2, amount = $3, gateway_transaction_no = $4, failure_code = $5, paid_at = $6, updated_at = $7 WHERE id = $1")
        .bind(p.id).bind(p.status.as_str()).bind(p.amount.amount()).bind(&p.gateway_transaction_no)
        .bind(&p.failure_code).bind(p.paid_at).bind(p.updated_at)
        .execute(&mut *conn).await.map_err(log_db("Failed to update payment"))?;
    Ok(())
}

/// Lock the order owning `sub_order_id`, run `f` over it and persist what changed.
async fn with_fulfilment<F>(conn: &mut PgConnection, sub_order_id: Uuid, f: F) -> Result<(TransitionEffects, Payment)>
where
    F: FnOnce(&mut Fulfilment<'_>) -> std::result::Result<TransitionEffects, OrderError> + Send,
{
    let (order_id,): (Uuid,) = sqlx::query_as("SELECT order_id FROM sub_orders WHERE id = $1")
        .bind(sub_order_id).fetch_optional(&mut *conn).await?.ok_or(OrderError::SubOrderNotFound)?;
    let order_row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id).fetch_optional(&mut *conn).await?.ok_or(OrderError::NotFound)?;
    let mut order = Order::try_from(order_row)?;
    let mut subs = sqlx::query_as::<_, SubOrderRow>("SELECT * FROM sub_orders WHERE order_id = $1 ORDER BY id FOR UPDATE")
        .bind(order_id).fetch_all(&mut *conn).await?
        .into_iter().map(SubOrder::try_from).collect::<std::result::Result<Vec<_>, _>>()?;
    let mut payment = load_payment(conn, order_id).await?;

    let effects = f(&mut Fulfilment { order: &mut order, sub_orders: &mut subs, payment: &mut payment })?;

    if effects.order_changed {
        sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(order.id).bind(order.status.as_str()).bind(order.updated_at)
            .execute(&mut *conn).await.map_err(log_db("Failed to update order status"))?;
    }
    if effects.sub_order_changed {
        if let Some(sub) = subs.iter().find(|s| s.id == sub_order_id) {
            sqlx::query("UPDATE sub_orders SET status = $2, completed_at = $3, updated_at = $4 WHERE id = $1")
                .bind(sub.id).bind(sub.status.as_str()).bind(sub.completed_at).bind(sub.updated_at)
                .execute(&mut *conn).await.map_err(log_db("Failed to update sub-order status"))?;
        }
    }
    update_payment(conn, &payment).await?;
    if effects.restore_stock {
        sqlx::query("UPDATE product_variants SET stock = stock + oi.quantity, updated_at = NOW() FROM order_items oi WHERE oi.sub_order_id = $1 AND product_variants.id = oi.variant_id")
            .bind(sub_order_id).execute(&mut *conn).await.map_err(log_db("Failed to restore stock"))?;
    }
    if let Some(refund) = &effects.refund {
        insert_refund(conn, refund).await?;
    }
    Ok((effects, payment))
}

impl PgStore {
    async fn detail(&self, order: Order) -> Result<OrderDetail> {
        let subs = sqlx::query_as::<_, SubOrderRow>("SELECT * FROM sub_orders WHERE order_id = $1 ORDER BY id")
            .bind(order.id).fetch_all(&self.pool).await?;
        let sub_ids: Vec<Uuid> = subs.iter().map(|s| s.id).collect();
        let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in sqlx::query_as::<_, OrderItemRow>("SELECT * FROM order_items WHERE sub_order_id = ANY($1) ORDER BY id")
            .bind(&sub_ids).fetch_all(&self.pool).await?
        {
            items.entry(row.sub_order_id).or_default().push(row.into());
        }
        let mut shipments: HashMap<Uuid, Shipment> = HashMap::new();
        for row in sqlx::query_as::<_, ShipmentRow>("SELECT * FROM shipments WHERE sub_order_id = ANY($1)")
            .bind(&sub_ids).fetch_all(&self.pool).await?
        {
            let shipment = Shipment::try_from(row)?;
            shipments.insert(shipment.sub_order_id, shipment);
        }
        let payment = sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE order_id = $1")
            .bind(order.id).fetch_optional(&self.pool).await?.ok_or(MarketplaceError::NotFound("payment"))?;

        let mut sub_orders = Vec::with_capacity(subs.len());
        for row in subs {
            let sub_order = SubOrder::try_from(row)?;
            let shipment = shipments.remove(&sub_order.id).ok_or(MarketplaceError::NotFound("shipment"))?;
            let items = items.remove(&sub_order.id).unwrap_or_default();
            sub_orders.push(SubOrderDetail { sub_order, items, shipment });
        }
        Ok(OrderDetail { order, sub_orders, payment: payment.try_into()? })
    }

    async fn settlement_detail(&self, settlement: Settlement) -> Result<SettlementDetail> {
        let items = sqlx::query_as::<_, SettlementItemRow>("SELECT * FROM settlement_items WHERE settlement_id = $1 ORDER BY completed_at, id")
            .bind(settlement.id).fetch_all(&self.pool).await?
            .into_iter().map(SettlementItem::from).collect();
        let refunds = sqlx::query_as::<_, RefundRow>("SELECT * FROM refunds WHERE settlement_id = $1 ORDER BY id")
            .bind(settlement.id).fetch_all(&self.pool).await?
            .into_iter().map(Refund::try_from).collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(SettlementDetail { settlement, items, refunds })
    }
}

// =============================================================================
// Repositories
// =============================================================================

#[async_trait]
impl CatalogRepository for PgStore {
    async fn variants(&self, ids: &[Uuid]) -> Result<Vec<Variant>> {
        let rows = sqlx::query_as::<_, VariantRow>("SELECT * FROM product_variants WHERE id = ANY($1)")
            .bind(ids).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Variant::from).collect())
    }

    async fn user_address(&self, user_id: Uuid, address_id: Uuid) -> Result<Address> {
        let row: Option<(Json<Address>,)> = sqlx::query_as("SELECT address FROM user_addresses WHERE id = $1 AND user_id = $2")
            .bind(address_id).bind(user_id).fetch_optional(&self.pool).await?;
        row.map(|(a,)| a.0).ok_or(MarketplaceError::NotFound("address"))
    }

    async fn store_address(&self, store_id: Uuid) -> Result<Address> {
        let row: Option<(Json<Address>,)> = sqlx::query_as("SELECT address FROM store_addresses WHERE store_id = $1")
            .bind(store_id).fetch_optional(&self.pool).await?;
        row.map(|(a,)| a.0).ok_or(MarketplaceError::NotFound("store address"))
    }
}

#[async_trait]
impl CartRepository for PgStore {
    async fn load_cart(&self, user_id: Uuid) -> Result<Cart> {
        let updated: Option<(DateTime<Utc>,)> = sqlx::query_as("SELECT updated_at FROM carts WHERE user_id = $1")
            .bind(user_id).fetch_optional(&self.pool).await?;
        let Some((updated_at,)) = updated else { return Ok(Cart::empty(user_id)) };
        let lines: Vec<(Uuid, i32)> = sqlx::query_as("SELECT variant_id, quantity FROM cart_lines WHERE user_id = $1 ORDER BY position")
            .bind(user_id).fetch_all(&self.pool).await?;
        let lines = lines.into_iter().map(|(variant_id, quantity)| CartLine { variant_id, quantity: to_u32(quantity) }).collect();
        Ok(Cart::restore(user_id, lines, updated_at))
    }

    async fn save_cart(&self, cart: &Cart) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO carts (user_id, updated_at) VALUES ($1, $2) ON CONFLICT (user_id) DO UPDATE SET updated_at = EXCLUDED.updated_at")
            .bind(cart.user_id()).bind(cart.updated_at()).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM cart_lines WHERE user_id = $1").bind(cart.user_id()).execute(&mut *tx).await?;
        for (position, line) in cart.lines().iter().enumerate() {
            sqlx::query("INSERT INTO cart_lines (user_id, variant_id, quantity, position) VALUES ($1, $2, $3, $4)")
                .bind(cart.user_id()).bind(line.variant_id).bind(to_i32(line.quantity)).bind(i32::try_from(position).unwrap_or(i32::MAX))
                .execute(&mut *tx).await?;
        }
        tx.commit().await.map_err(log_db("Failed to save cart"))?;
        Ok(())
    }
}

#[async_trait]
impl VoucherRepository for PgStore {
    async fn create_voucher(&self, v: &Voucher) -> Result<()> {
        let (discount_type, discount_value) = match v.discount {
            Discount::Percentage(pct) => ("percentage", pct),
            Discount::Fixed(amount) => ("fixed", Decimal::from(amount.amount())),
        };
        sqlx::query("INSERT INTO vouchers (id, code, scope, discount_type, discount_value, max_discount, min_order_value, usage_limit, per_user_limit, store_id, starts_at, ends_at, is_active) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)")
            .bind(v.id).bind(v.code.as_str()).bind(v.scope.as_str()).bind(discount_type).bind(discount_value)
            .bind(v.max_discount.map(|m| m.amount())).bind(v.min_order_value.amount()).bind(v.usage_limit.map(to_i32))
            .bind(v.per_user_limit.map(to_i32)).bind(v.store_id).bind(v.starts_at).bind(v.ends_at).bind(v.is_active)
            .execute(&self.pool).await
            .map_err(|e| if is_unique_violation(&e) { VoucherError::DuplicateCode.into() } else { log_db("Failed to create voucher")(e) })?;
        Ok(())
    }

    async fn voucher_by_code(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
        let row = sqlx::query_as::<_, VoucherRow>("SELECT * FROM vouchers WHERE code = $1")
            .bind(code.as_str()).fetch_optional(&self.pool).await?;
        Ok(row.map(Voucher::try_from).transpose()?)
    }

    async fn reserve_voucher(&self, request: &ReservationRequest) -> Result<VoucherReservation> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, VoucherRow>("SELECT * FROM vouchers WHERE code = $1 FOR UPDATE")
            .bind(request.code.as_str()).fetch_optional(&mut *tx).await?.ok_or(VoucherError::NotFound)?;
        let voucher = Voucher::try_from(row)?;
        let held = sqlx::query_as::<_, ReservationRow>("SELECT * FROM voucher_reservations WHERE voucher_id = $1 AND status IN ('active', 'consumed')")
            .bind(voucher.id).fetch_all(&mut *tx).await?
            .into_iter().map(VoucherReservation::try_from).collect::<std::result::Result<Vec<_>, _>>()?;
        voucher.check_redeemable(usage_of(&held, request.user_id, request.now), request.eligible_amount, request.now)?;

        let r = voucher.reserve_for(request.user_id, request.now, request.ttl);
        sqlx::query("INSERT INTO voucher_reservations (id, voucher_id, user_id, status, reserved_at, expires_at, order_id) VALUES ($1, $2, $3, $4, $5, $6, $7)")
            .bind(r.id).bind(r.voucher_id).bind(r.user_id).bind(r.status.as_str()).bind(r.reserved_at).bind(r.expires_at).bind(r.order_id)
            .execute(&mut *tx).await.map_err(log_db("Failed to insert voucher reservation"))?;
        tx.commit().await?;
        Ok(r)
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<(VoucherReservation, Voucher)>> {
        let Some(row) = sqlx::query_as::<_, ReservationRow>("SELECT * FROM voucher_reservations WHERE id = $1")
            .bind(id).fetch_optional(&self.pool).await? else { return Ok(None) };
        let reservation = VoucherReservation::try_from(row)?;
        let voucher = sqlx::query_as::<_, VoucherRow>("SELECT * FROM vouchers WHERE id = $1")
            .bind(reservation.voucher_id).fetch_optional(&self.pool).await?.ok_or(VoucherError::NotFound)?;
        Ok(Some((reservation, voucher.try_into()?)))
    }

    async fn release_reservation(&self, id: Uuid, user_id: Uuid) -> Result<VoucherReservation> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ReservationRow>("SELECT * FROM voucher_reservations WHERE id = $1 FOR UPDATE")
            .bind(id).fetch_optional(&mut *tx).await?.ok_or(VoucherError::ReservationNotFound)?;
        let mut reservation = VoucherReservation::try_from(row)?;
        if reservation.release(user_id)? {
            sqlx::query("UPDATE voucher_reservations SET status = $2 WHERE id = $1")
                .bind(id).bind(reservation.status.as_str()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(reservation)
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("UPDATE voucher_reservations SET status = 'expired' WHERE status = 'active' AND expires_at <= $1")
            .bind(now).execute(&self.pool).await.map_err(log_db("Failed to expire reservations"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn commit_checkout(&self, plan: &CheckoutPlan, now: DateTime<Utc>) -> Result<()> {
        let order = &plan.order;
        let mut tx = self.pool.begin().await?;

        // Ascending variant id, so concurrent checkouts lock in the same order.
        for (variant_id, quantity) in plan.stock_requirements() {
            let (stock,): (i32,) = sqlx::query_as("SELECT stock FROM product_variants WHERE id = $1 FOR UPDATE")
                .bind(variant_id).fetch_optional(&mut *tx).await?.ok_or(MarketplaceError::NotFound("variant"))?;
            let available = to_u32(stock);
            if quantity > available {
                return Err(StockError::Insufficient { variant_id, requested: quantity, available }.into());
            }
            sqlx::query("UPDATE product_variants SET stock = stock - $2, updated_at = $3 WHERE id = $1")
                .bind(variant_id).bind(to_i32(quantity)).bind(now).execute(&mut *tx).await?;
        }

        for id in &plan.reservation_ids {
            let row = sqlx::query_as::<_, ReservationRow>("SELECT * FROM voucher_reservations WHERE id = $1 FOR UPDATE")
                .bind(id).fetch_optional(&mut *tx).await?.ok_or(VoucherError::ReservationNotFound)?;
            let mut reservation = VoucherReservation::try_from(row)?;
            reservation.ensure_consumable(order.user_id, now)?;
            reservation.consume(order.id, now)?;
            sqlx::query("UPDATE voucher_reservations SET status = $2, order_id = $3 WHERE id = $1")
                .bind(reservation.id).bind(reservation.status.as_str()).bind(reservation.order_id).execute(&mut *tx).await?;
        }

        sqlx::query("INSERT INTO orders (id, code, user_id, status, items_subtotal, shipping_total, discount_total, grand_total, payment_method, shipping_address, note, idempotency_key, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)")
            .bind(order.id).bind(&order.code).bind(order.user_id).bind(order.status.as_str()).bind(order.items_subtotal.amount())
            .bind(order.shipping_total.amount()).bind(order.discount_total.amount()).bind(order.grand_total.amount())
            .bind(order.payment_method.as_str()).bind(Json(&order.shipping_address)).bind(&order.note).bind(&order.idempotency_key)
            .bind(order.created_at).bind(order.updated_at)
            .execute(&mut *tx).await
            .map_err(|e| if violates(&e, "orders_code_key") {
                OrderError::DuplicateCode(order.code.clone()).into()
            } else if is_unique_violation(&e) {
                MarketplaceError::Conflict(format!("order with idempotency key {:?} already exists", order.idempotency_key))
            } else {
                log_db("Failed to insert order")(e)
            })?;

        for sub_plan in &plan.sub_orders {
            let s = &sub_plan.sub_order;
            sqlx::query("INSERT INTO sub_orders (id, order_id, store_id, status, items_subtotal, shipping_fee, store_discount, platform_discount, shipping_discount, total, completed_at, settlement_id, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)")
                .bind(s.id).bind(s.order_id).bind(s.store_id).bind(s.status.as_str()).bind(s.items_subtotal.amount())
                .bind(s.shipping_fee.amount()).bind(s.store_discount.amount()).bind(s.platform_discount.amount())
                .bind(s.shipping_discount.amount()).bind(s.total.amount()).bind(s.completed_at).bind(s.settlement_id)
                .bind(s.created_at).bind(s.updated_at)
                .execute(&mut *tx).await.map_err(log_db("Failed to insert sub-order"))?;
            for i in &sub_plan.items {
                sqlx::query("INSERT INTO order_items (id, sub_order_id, variant_id, product_name, sku, unit_price, quantity, line_total) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
                    .bind(i.id).bind(i.sub_order_id).bind(i.variant_id).bind(&i.product_name).bind(&i.sku)
                    .bind(i.unit_price.amount()).bind(to_i32(i.quantity)).bind(i.line_total.amount())
                    .execute(&mut *tx).await?;
            }
            let sh = &sub_plan.shipment;
            sqlx::query("INSERT INTO shipments (id, sub_order_id, carrier, label, status, fee, carrier_status_code, last_error, estimated_delivery, pickup_address, delivery_address, weight_grams, cod_amount, declared_value, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)")
                .bind(sh.id).bind(sh.sub_order_id).bind(&sh.carrier).bind(&sh.label).bind(sh.status.as_str()).bind(sh.fee.amount())
                .bind(sh.carrier_status_code).bind(&sh.last_error).bind(&sh.estimated_delivery).bind(Json(&sh.pickup_address))
                .bind(Json(&sh.delivery_address)).bind(to_i32(sh.weight_grams)).bind(sh.cod_amount.amount()).bind(sh.declared_value.amount())
                .bind(sh.created_at).bind(sh.updated_at)
                .execute(&mut *tx).await.map_err(log_db("Failed to insert shipment"))?;
        }

        let p = &plan.payment;
        sqlx::query("INSERT INTO payments (id, order_id, method, status, amount, txn_ref, gateway_transaction_no, failure_code, paid_at, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)")
            .bind(p.id).bind(p.order_id).bind(p.method.as_str()).bind(p.status.as_str()).bind(p.amount.amount()).bind(&p.txn_ref)
            .bind(&p.gateway_transaction_no).bind(&p.failure_code).bind(p.paid_at).bind(p.created_at).bind(p.updated_at)
            .execute(&mut *tx).await.map_err(log_db("Failed to insert payment"))?;

        sqlx::query("DELETE FROM cart_lines WHERE user_id = $1 AND variant_id = ANY($2)")
            .bind(order.user_id).bind(plan.purchased_variants()).execute(&mut *tx).await?;
        sqlx::query("UPDATE carts SET updated_at = $2 WHERE user_id = $1").bind(order.user_id).bind(now).execute(&mut *tx).await?;

        tx.commit().await.map_err(log_db("Failed to commit checkout"))?;
        Ok(())
    }

    async fn order_by_idempotency_key(&self, user_id: Uuid, key: &str) -> Result<Option<OrderDetail>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE user_id = $1 AND idempotency_key = $2")
            .bind(user_id).bind(key).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(self.detail(row.try_into()?).await?)),
            None => Ok(None),
        }
    }

    async fn order_detail(&self, order_id: Uuid) -> Result<Option<OrderDetail>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1").bind(order_id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(self.detail(row.try_into()?).await?)),
            None => Ok(None),
        }
    }

    async fn sub_order(&self, id: Uuid) -> Result<Option<SubOrder>> {
        let row = sqlx::query_as::<_, SubOrderRow>("SELECT * FROM sub_orders WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(SubOrder::try_from).transpose()?)
    }

    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<OrderDetail>> {
        let rows = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE user_id = $1 ORDER BY created_at DESC, id DESC")
            .bind(user_id).fetch_all(&self.pool).await?;
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows { orders.push(self.detail(row.try_into()?).await?); }
        Ok(orders)
    }

    async fn cancel_sub_order(&self, sub_order_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<CancelledSubOrder> {
        let mut tx = self.pool.begin().await?;
        let mut shipment = lock_shipment(&mut tx, "SELECT * FROM shipments WHERE sub_order_id = $1 FOR UPDATE", sub_order_id).await?;
        let (effects, _) = with_fulfilment(&mut tx, sub_order_id, |f| f.cancel_sub_order(sub_order_id, user_id, &mut shipment, now)).await?;
        update_shipment(&mut tx, &shipment).await?;
        let row = sqlx::query_as::<_, SubOrderRow>("SELECT * FROM sub_orders WHERE id = $1").bind(sub_order_id).fetch_one(&mut *tx).await?;
        tx.commit().await.map_err(log_db("Failed to commit sub-order cancellation"))?;
        Ok(CancelledSubOrder { sub_order: row.try_into()?, shipment, refund: effects.refund })
    }
}

#[async_trait]
impl ShipmentRepository for PgStore {
    async fn shipment(&self, id: Uuid) -> Result<Option<Shipment>> {
        let row = sqlx::query_as::<_, ShipmentRow>("SELECT * FROM shipments WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(Shipment::try_from).transpose()?)
    }

    async fn shipment_by_label(&self, label: &str) -> Result<Option<Shipment>> {
        let row = sqlx::query_as::<_, ShipmentRow>("SELECT * FROM shipments WHERE label = $1").bind(label).fetch_optional(&self.pool).await?;
        Ok(row.map(Shipment::try_from).transpose()?)
    }

    async fn shipment_for_sub_order(&self, sub_order_id: Uuid) -> Result<Option<Shipment>> {
        let row = sqlx::query_as::<_, ShipmentRow>("SELECT * FROM shipments WHERE sub_order_id = $1").bind(sub_order_id).fetch_optional(&self.pool).await?;
        Ok(row.map(Shipment::try_from).transpose()?)
    }

    async fn shipments_awaiting_carrier(&self, limit: i64) -> Result<Vec<Shipment>> {
        let rows = sqlx::query_as::<_, ShipmentRow>("SELECT * FROM shipments WHERE status = 'pending' AND label IS NULL ORDER BY created_at, id LIMIT $1")
            .bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Shipment::try_from).collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn shipments_in_flight(&self, limit: i64) -> Result<Vec<Shipment>> {
        let rows = sqlx::query_as::<_, ShipmentRow>("SELECT * FROM shipments WHERE label IS NOT NULL AND status NOT IN ('completed', 'returned', 'cancelled', 'lost') ORDER BY updated_at, id LIMIT $1")
            .bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Shipment::try_from).collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn record_carrier_order(&self, shipment_id: Uuid, order: &CarrierOrder, now: DateTime<Utc>) -> Result<Shipment> {
        let mut tx = self.pool.begin().await?;
        let mut shipment = lock_shipment(&mut tx, "SELECT * FROM shipments WHERE id = $1 FOR UPDATE", shipment_id).await?;
        let from = shipment.status;
        shipment.record_carrier_order(order, now)?;
        let (sub_order_id, to) = (shipment.sub_order_id, shipment.status);
        with_fulfilment(&mut tx, sub_order_id, |f| f.on_shipment_transition(sub_order_id, from, to, now)).await?;
        update_shipment(&mut tx, &shipment).await
            .map_err(|e| match e {
                MarketplaceError::Storage(ref db) if is_unique_violation(db) => ShipmentError::AlreadyRegistered(order.label.clone()).into(),
                other => other,
            })?;
        tx.commit().await?;
        Ok(shipment)
    }

    async fn record_carrier_failure(&self, shipment_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE shipments SET last_error = $2, updated_at = $3 WHERE id = $1")
            .bind(shipment_id).bind(error).bind(now).execute(&self.pool).await?;
        if result.rows_affected() == 0 { return Err(ShipmentError::NotFound.into()); }
        Ok(())
    }

    async fn apply_carrier_update(&self, shipment_id: Uuid, update: &CarrierUpdate, now: DateTime<Utc>) -> Result<AppliedUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut shipment = lock_shipment(&mut tx, "SELECT * FROM shipments WHERE id = $1 FOR UPDATE", shipment_id).await?;
        let before = shipment.clone();
        let outcome = shipment.apply(update, now);

        let recorded = sqlx::query("INSERT INTO shipment_events (update_key, shipment_id, status_code, outcome, reason, action_time, received_at) VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (update_key) DO NOTHING")
            .bind(update_key(shipment_id, update)).bind(shipment_id).bind(update.status_code).bind(outcome.as_str())
            .bind(&update.reason).bind(update.action_time).bind(now)
            .execute(&mut *tx).await.map_err(log_db("Failed to record shipment event"))?;
        if recorded.rows_affected() == 0 {
            return Ok(AppliedUpdate { outcome: ShipmentUpdateOutcome::Duplicate, shipment: before, payment_completed: None });
        }

        let mut payment_completed = None;
        if let ShipmentUpdateOutcome::Applied { from, to } = outcome {
            let sub_order_id = shipment.sub_order_id;
            let (effects, payment) = with_fulfilment(&mut tx, sub_order_id, |f| f.on_shipment_transition(sub_order_id, from, to, now)).await?;
            if effects.payment_completed { payment_completed = Some(payment); }
        }
        if shipment != before { update_shipment(&mut tx, &shipment).await?; }
        tx.commit().await.map_err(log_db("Failed to commit carrier update"))?;
        Ok(AppliedUpdate { outcome, shipment, payment_completed })
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn payment_by_txn_ref(&self, txn_ref: &str) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE txn_ref = $1").bind(txn_ref).fetch_optional(&self.pool).await?;
        Ok(row.map(Payment::try_from).transpose()?)
    }

    async fn record_gateway_result(&self, confirmation: &GatewayConfirmation, now: DateTime<Utc>) -> Result<(Payment, PaymentOutcome)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE txn_ref = $1 FOR UPDATE")
            .bind(&confirmation.txn_ref).fetch_optional(&mut *tx).await?.ok_or(PaymentError::NotFound)?;
        let mut payment = Payment::try_from(row)?;
        let outcome = payment.apply_confirmation(confirmation, now)?;
        if outcome != PaymentOutcome::AlreadyPaid { update_payment(&mut tx, &payment).await?; }
        tx.commit().await?;
        Ok((payment, outcome))
    }
}

#[async_trait]
impl SettlementRepository for PgStore {
    async fn eligible_sub_orders(&self, store_id: Uuid, period: &SettlementPeriod) -> Result<Vec<EligibleSubOrder>> {
        let rows = sqlx::query_as::<_, EligibleRow>("SELECT so.*, o.code AS order_code FROM sub_orders so JOIN orders o ON o.id = so.order_id WHERE so.store_id = $1 AND so.status = 'completed' AND so.settlement_id IS NULL AND so.completed_at >= $2 AND so.completed_at < $3 ORDER BY so.completed_at, so.id")
            .bind(store_id).bind(period.start).bind(period.end).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> Result<EligibleSubOrder> { Ok(EligibleSubOrder { sub_order: r.sub_order.try_into()?, order_code: r.order_code }) })
            .collect()
    }

    async fn create_settlement(&self, store_id: Uuid, period: &SettlementPeriod, commission_rate: Decimal, now: DateTime<Utc>) -> Result<SettlementDetail> {
        let mut tx = self.pool.begin().await?;
        // A concurrent run blocks here and re-checks settlement_id once the first commits.
        let eligible = sqlx::query_as::<_, EligibleRow>("SELECT so.*, o.code AS order_code FROM sub_orders so JOIN orders o ON o.id = so.order_id WHERE so.store_id = $1 AND so.status = 'completed' AND so.settlement_id IS NULL AND so.completed_at >= $2 AND so.completed_at < $3 ORDER BY so.completed_at, so.id FOR UPDATE OF so")
            .bind(store_id).bind(period.start).bind(period.end).fetch_all(&mut *tx).await?
            .into_iter()
            .map(|r| -> Result<EligibleSubOrder> { Ok(EligibleSubOrder { sub_order: r.sub_order.try_into()?, order_code: r.order_code }) })
            .collect::<Result<Vec<_>>>()?;
        let refunds = sqlx::query_as::<_, RefundRow>("SELECT * FROM refunds WHERE store_id = $1 AND status = 'approved' AND chargeable_to_store AND settlement_id IS NULL ORDER BY id FOR UPDATE")
            .bind(store_id).fetch_all(&mut *tx).await?
            .into_iter().map(Refund::try_from).collect::<std::result::Result<Vec<_>, _>>()?;

        let (s, items) = Settlement::build(store_id, *period, commission_rate, &eligible, &refunds, now)?;
        sqlx::query("INSERT INTO settlements (id, store_id, period_start, period_end, status, gross_amount, discount_amount, commission_amount, refund_amount, net_amount, commission_rate, payout_reference, created_at, paid_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)")
            .bind(s.id).bind(s.store_id).bind(s.period_start).bind(s.period_end).bind(s.status.as_str()).bind(s.gross_amount.amount())
            .bind(s.discount_amount.amount()).bind(s.commission_amount.amount()).bind(s.refund_amount.amount()).bind(s.net_amount.amount())
            .bind(s.commission_rate).bind(&s.payout_reference).bind(s.created_at).bind(s.paid_at)
            .execute(&mut *tx).await.map_err(log_db("Failed to insert settlement"))?;
        for i in &items {
            sqlx::query("INSERT INTO settlement_items (id, settlement_id, sub_order_id, order_code, items_subtotal, store_discount, commission, net_amount, completed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)")
                .bind(i.id).bind(i.settlement_id).bind(i.sub_order_id).bind(&i.order_code).bind(i.items_subtotal.amount())
                .bind(i.store_discount.amount()).bind(i.commission.amount()).bind(i.net_amount.amount()).bind(i.completed_at)
                .execute(&mut *tx).await?;
        }
        let sub_ids: Vec<Uuid> = eligible.iter().map(|e| e.sub_order.id).collect();
        sqlx::query("UPDATE sub_orders SET settlement_id = $1 WHERE id = ANY($2)").bind(s.id).bind(&sub_ids).execute(&mut *tx).await?;
        let refund_ids: Vec<Uuid> = refunds.iter().filter(|r| r.is_settleable()).map(|r| r.id).collect();
        sqlx::query("UPDATE refunds SET settlement_id = $1 WHERE id = ANY($2)").bind(s.id).bind(&refund_ids).execute(&mut *tx).await?;
        tx.commit().await.map_err(log_db("Failed to commit settlement"))?;

        let refunds = refunds.into_iter()
            .filter(|r| refund_ids.contains(&r.id))
            .map(|mut r| { r.settlement_id = Some(s.id); r })
            .collect();
        Ok(SettlementDetail { settlement: s, items, refunds })
    }

    async fn settlement(&self, id: Uuid) -> Result<Option<SettlementDetail>> {
        let row = sqlx::query_as::<_, SettlementRow>("SELECT * FROM settlements WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(self.settlement_detail(row.try_into()?).await?)),
            None => Ok(None),
        }
    }

    async fn settlements_for_store(&self, store_id: Uuid) -> Result<Vec<Settlement>> {
        let rows = sqlx::query_as::<_, SettlementRow>("SELECT * FROM settlements WHERE store_id = $1 ORDER BY created_at DESC, id DESC")
            .bind(store_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Settlement::try_from).collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn mark_settlement_paid(&self, id: Uuid, reference: &str, now: DateTime<Utc>) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SettlementRow>("SELECT * FROM settlements WHERE id = $1 FOR UPDATE")
            .bind(id).fetch_optional(&mut *tx).await?.ok_or(SettlementError::NotFound)?;
        let mut settlement = Settlement::try_from(row)?;
        settlement.mark_paid(reference, now)?;
        sqlx::query("UPDATE settlements SET status = $2, payout_reference = $3, paid_at = $4 WHERE id = $1")
            .bind(id).bind(settlement.status.as_str()).bind(&settlement.payout_reference).bind(settlement.paid_at)
            .execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(settlement)
    }

    async fn cancel_settlement(&self, id: Uuid) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SettlementRow>("SELECT * FROM settlements WHERE id = $1 FOR UPDATE")
            .bind(id).fetch_optional(&mut *tx).await?.ok_or(SettlementError::NotFound)?;
        let mut settlement = Settlement::try_from(row)?;
        settlement.cancel()?;
        sqlx::query("UPDATE settlements SET status = $2 WHERE id = $1").bind(id).bind(settlement.status.as_str()).execute(&mut *tx).await?;
        sqlx::query("UPDATE sub_orders SET settlement_id = NULL WHERE settlement_id = $1").bind(id).execute(&mut *tx).await?;
        sqlx::query("UPDATE refunds SET settlement_id = NULL WHERE settlement_id = $1").bind(id).execute(&mut *tx).await?;
        tx.commit().await.map_err(log_db("Failed to cancel settlement"))?;
        Ok(settlement)
    }

    async fn request_refund(&self, sub_order_id: Uuid, amount: Money, reason: &str, now: DateTime<Utc>) -> Result<Refund> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SubOrderRow>("SELECT * FROM sub_orders WHERE id = $1 FOR UPDATE")
            .bind(sub_order_id).fetch_optional(&mut *tx).await?.ok_or(OrderError::SubOrderNotFound)?;
        let sub = SubOrder::try_from(row)?;
        let existing = sqlx::query_as::<_, RefundRow>("SELECT * FROM refunds WHERE sub_order_id = $1")
            .bind(sub_order_id).fetch_all(&mut *tx).await?
            .into_iter().map(Refund::try_from).collect::<std::result::Result<Vec<_>, _>>()?;
        let refund = Refund::request(&sub, amount, reason, &existing, now)?;
        insert_refund(&mut tx, &refund).await?;
        tx.commit().await?;
        Ok(refund)
    }

    async fn decide_refund(&self, refund_id: Uuid, approve: bool, now: DateTime<Utc>) -> Result<Refund> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RefundRow>("SELECT * FROM refunds WHERE id = $1 FOR UPDATE")
            .bind(refund_id).fetch_optional(&mut *tx).await?.ok_or(SettlementError::RefundNotFound)?;
        let mut refund = Refund::try_from(row)?;
        refund.decide(approve, now)?;
        sqlx::query("UPDATE refunds SET status = $2, decided_at = $3 WHERE id = $1")
            .bind(refund_id).bind(refund.status.as_str()).bind(refund.decided_at).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(refund)
    }
}
