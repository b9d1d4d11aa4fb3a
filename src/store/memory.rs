//! In-memory store for development and tests.
//!
//! All state sits behind one `tokio::sync::Mutex`; each trait method holds the guard for
//! its whole duration, which gives the same all-or-nothing behaviour as a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::domain::aggregates::settlement::is_eligible;
use crate::domain::aggregates::shipment::update_key;
use crate::domain::aggregates::voucher::usage_of;
use crate::domain::aggregates::{
    Address, Cart, CarrierOrder, CarrierUpdate, CheckoutPlan, EligibleSubOrder, Fulfilment, GatewayConfirmation, Order,
    OrderError, OrderItem, Payment, PaymentError, PaymentOutcome, Refund, Settlement, SettlementError, SettlementItem,
    SettlementPeriod, Shipment, ShipmentError, ShipmentStatus, ShipmentUpdateOutcome, SubOrder, TransitionEffects,
    Variant, Voucher, VoucherError, VoucherReservation,
};
use crate::domain::value_objects::{Money, VoucherCode};
use crate::{MarketplaceError, Result};
use super::{
    AppliedUpdate, CancelledSubOrder, CartRepository, CatalogRepository, OrderDetail, OrderRepository, PaymentRepository,
    ReservationRequest, SettlementDetail, SettlementRepository, ShipmentRepository, SubOrderDetail, VoucherRepository,
};

#[derive(Default)]
struct State {
    variants: HashMap<Uuid, Variant>,
    user_addresses: HashMap<(Uuid, Uuid), Address>,
    store_addresses: HashMap<Uuid, Address>,
    carts: HashMap<Uuid, Cart>,
    vouchers: HashMap<Uuid, Voucher>,
    reservations: HashMap<Uuid, VoucherReservation>,
    orders: HashMap<Uuid, Order>,
    sub_orders: HashMap<Uuid, SubOrder>,
    items: Vec<OrderItem>,
    shipments: HashMap<Uuid, Shipment>,
    /// Keyed by order id.
    payments: HashMap<Uuid, Payment>,
    processed_updates: HashSet<String>,
    settlements: HashMap<Uuid, Settlement>,
    settlement_items: Vec<SettlementItem>,
    refunds: HashMap<Uuid, Refund>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn add_variant(&self, variant: Variant) {
        self.state.lock().await.variants.insert(variant.id, variant);
    }

    pub async fn add_user_address(&self, user_id: Uuid, address_id: Uuid, address: Address) {
        self.state.lock().await.user_addresses.insert((user_id, address_id), address);
    }

    pub async fn add_store_address(&self, store_id: Uuid, address: Address) {
        self.state.lock().await.store_addresses.insert(store_id, address);
    }
}

impl State {
    fn sub_orders_of(&self, order_id: Uuid) -> Vec<SubOrder> {
        let mut subs: Vec<SubOrder> = self.sub_orders.values().filter(|s| s.order_id == order_id).cloned().collect();
        subs.sort_by_key(|s| s.id);
        subs
    }

    fn detail(&self, order: &Order) -> Result<OrderDetail> {
        let mut sub_orders = Vec::new();
        for sub_order in self.sub_orders_of(order.id) {
            let items = self.items.iter().filter(|i| i.sub_order_id == sub_order.id).cloned().collect();
            let shipment = self.shipment_of(sub_order.id)?.clone();
            sub_orders.push(SubOrderDetail { sub_order, items, shipment });
        }
        let payment = self.payments.get(&order.id).cloned().ok_or(MarketplaceError::NotFound("payment"))?;
        Ok(OrderDetail { order: order.clone(), sub_orders, payment })
    }

    fn shipment_of(&self, sub_order_id: Uuid) -> Result<&Shipment> {
        self.shipments.values().find(|s| s.sub_order_id == sub_order_id).ok_or(MarketplaceError::NotFound("shipment"))
    }

    /// Run `f` against the order owning `sub_order_id` and write back whatever it changed.
    fn with_fulfilment<F>(&mut self, sub_order_id: Uuid, f: F) -> Result<TransitionEffects>
    where
        F: FnOnce(&mut Fulfilment<'_>) -> std::result::Result<TransitionEffects, OrderError>,
    {
        let order_id = self.sub_orders.get(&sub_order_id).ok_or(OrderError::SubOrderNotFound)?.order_id;
        let mut order = self.orders.get(&order_id).cloned().ok_or(OrderError::NotFound)?;
        let mut subs = self.sub_orders_of(order_id);
        let mut payment = self.payments.get(&order_id).cloned().ok_or(MarketplaceError::NotFound("payment"))?;
        let effects = f(&mut Fulfilment { order: &mut order, sub_orders: &mut subs, payment: &mut payment })?;

        if effects.restore_stock {
            for item in self.items.iter().filter(|i| i.sub_order_id == sub_order_id) {
                if let Some(variant) = self.variants.get_mut(&item.variant_id) { variant.restore_stock(item.quantity); }
            }
        }
        if let Some(refund) = &effects.refund { self.refunds.insert(refund.id, refund.clone()); }
        for sub in subs { self.sub_orders.insert(sub.id, sub); }
        self.orders.insert(order.id, order);
        self.payments.insert(order_id, payment);
        Ok(effects)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn variants(&self, ids: &[Uuid]) -> Result<Vec<Variant>> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.variants.get(id).cloned()).collect())
    }

    async fn user_address(&self, user_id: Uuid, address_id: Uuid) -> Result<Address> {
        let state = self.state.lock().await;
        state.user_addresses.get(&(user_id, address_id)).cloned().ok_or(MarketplaceError::NotFound("address"))
    }

    async fn store_address(&self, store_id: Uuid) -> Result<Address> {
        let state = self.state.lock().await;
        state.store_addresses.get(&store_id).cloned().ok_or(MarketplaceError::NotFound("store address"))
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn load_cart(&self, user_id: Uuid) -> Result<Cart> {
        let state = self.state.lock().await;
        Ok(state.carts.get(&user_id).cloned().unwrap_or_else(|| Cart::empty(user_id)))
    }

    async fn save_cart(&self, cart: &Cart) -> Result<()> {
        self.state.lock().await.carts.insert(cart.user_id(), cart.clone());
        Ok(())
    }
}

#[async_trait]
impl VoucherRepository for MemoryStore {
    async fn create_voucher(&self, voucher: &Voucher) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.vouchers.values().any(|v| v.code == voucher.code) { return Err(VoucherError::DuplicateCode.into()); }
        state.vouchers.insert(voucher.id, voucher.clone());
        Ok(())
    }

    async fn voucher_by_code(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
        let state = self.state.lock().await;
        Ok(state.vouchers.values().find(|v| &v.code == code).cloned())
    }

    async fn reserve_voucher(&self, request: &ReservationRequest) -> Result<VoucherReservation> {
        let mut state = self.state.lock().await;
        let voucher = state.vouchers.values().find(|v| v.code == request.code).cloned().ok_or(VoucherError::NotFound)?;
        let usage = usage_of(state.reservations.values().filter(|r| r.voucher_id == voucher.id), request.user_id, request.now);
        voucher.check_redeemable(usage, request.eligible_amount, request.now)?;
        let reservation = voucher.reserve_for(request.user_id, request.now, request.ttl);
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<(VoucherReservation, Voucher)>> {
        let state = self.state.lock().await;
        let Some(reservation) = state.reservations.get(&id) else { return Ok(None) };
        let voucher = state.vouchers.get(&reservation.voucher_id).cloned().ok_or(VoucherError::NotFound)?;
        Ok(Some((reservation.clone(), voucher)))
    }

    async fn release_reservation(&self, id: Uuid, user_id: Uuid) -> Result<VoucherReservation> {
        let mut state = self.state.lock().await;
        let reservation = state.reservations.get_mut(&id).ok_or(VoucherError::ReservationNotFound)?;
        reservation.release(user_id)?;
        Ok(reservation.clone())
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state.reservations.values_mut().map(|r| r.expire_if_due(now)).filter(|expired| *expired).count() as u64)
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn commit_checkout(&self, plan: &CheckoutPlan, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let order = &plan.order;
        if state.orders.values().any(|o| o.code == order.code) {
            return Err(OrderError::DuplicateCode(order.code.clone()).into());
        }
        if let Some(key) = &order.idempotency_key {
            if state.orders.values().any(|o| o.user_id == order.user_id && o.idempotency_key.as_ref() == Some(key)) {
                return Err(MarketplaceError::Conflict(format!("order with idempotency key {key} already exists")));
            }
        }

        // Work on copies so a failure halfway leaves nothing behind.
        let mut variants = Vec::new();
        for (variant_id, quantity) in plan.stock_requirements() {
            let mut variant = state.variants.get(&variant_id).cloned().ok_or(MarketplaceError::NotFound("variant"))?;
            variant.take_stock(quantity)?;
            variants.push(variant);
        }
        let mut reservations = Vec::new();
        for id in &plan.reservation_ids {
            let mut reservation = state.reservations.get(id).cloned().ok_or(VoucherError::ReservationNotFound)?;
            reservation.ensure_consumable(order.user_id, now)?;
            reservation.consume(order.id, now)?;
            reservations.push(reservation);
        }

        for variant in variants { state.variants.insert(variant.id, variant); }
        for reservation in reservations { state.reservations.insert(reservation.id, reservation); }
        state.orders.insert(order.id, order.clone());
        for sub in &plan.sub_orders {
            state.sub_orders.insert(sub.sub_order.id, sub.sub_order.clone());
            state.items.extend(sub.items.iter().cloned());
            state.shipments.insert(sub.shipment.id, sub.shipment.clone());
        }
        state.payments.insert(order.id, plan.payment.clone());
        if let Some(cart) = state.carts.get_mut(&order.user_id) { cart.remove_purchased(&plan.purchased_variants()); }
        Ok(())
    }

    async fn order_by_idempotency_key(&self, user_id: Uuid, key: &str) -> Result<Option<OrderDetail>> {
        let state = self.state.lock().await;
        let order = state.orders.values().find(|o| o.user_id == user_id && o.idempotency_key.as_deref() == Some(key));
        order.map(|o| state.detail(o)).transpose()
    }

    async fn order_detail(&self, order_id: Uuid) -> Result<Option<OrderDetail>> {
        let state = self.state.lock().await;
        state.orders.get(&order_id).map(|o| state.detail(o)).transpose()
    }

    async fn sub_order(&self, id: Uuid) -> Result<Option<SubOrder>> {
        Ok(self.state.lock().await.sub_orders.get(&id).cloned())
    }

    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<OrderDetail>> {
        let state = self.state.lock().await;
        let mut orders: Vec<&Order> = state.orders.values().filter(|o| o.user_id == user_id).collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        orders.into_iter().map(|o| state.detail(o)).collect()
    }

    async fn cancel_sub_order(&self, sub_order_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<CancelledSubOrder> {
        let mut state = self.state.lock().await;
        let mut shipment = state.shipment_of(sub_order_id)?.clone();
        let effects = state.with_fulfilment(sub_order_id, |f| f.cancel_sub_order(sub_order_id, user_id, &mut shipment, now))?;
        state.shipments.insert(shipment.id, shipment.clone());
        let sub_order = state.sub_orders.get(&sub_order_id).cloned().ok_or(OrderError::SubOrderNotFound)?;
        Ok(CancelledSubOrder { sub_order, shipment, refund: effects.refund })
    }
}

#[async_trait]
impl ShipmentRepository for MemoryStore {
    async fn shipment(&self, id: Uuid) -> Result<Option<Shipment>> {
        Ok(self.state.lock().await.shipments.get(&id).cloned())
    }

    async fn shipment_by_label(&self, label: &str) -> Result<Option<Shipment>> {
        let state = self.state.lock().await;
        Ok(state.shipments.values().find(|s| s.label.as_deref() == Some(label)).cloned())
    }

    async fn shipment_for_sub_order(&self, sub_order_id: Uuid) -> Result<Option<Shipment>> {
        let state = self.state.lock().await;
        Ok(state.shipments.values().find(|s| s.sub_order_id == sub_order_id).cloned())
    }

    async fn shipments_awaiting_carrier(&self, limit: i64) -> Result<Vec<Shipment>> {
        let state = self.state.lock().await;
        let mut pending: Vec<Shipment> = state.shipments.values()
            .filter(|s| s.status == ShipmentStatus::Pending && s.label.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|s| (s.created_at, s.id));
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn shipments_in_flight(&self, limit: i64) -> Result<Vec<Shipment>> {
        let state = self.state.lock().await;
        let mut in_flight: Vec<Shipment> = state.shipments.values().filter(|s| s.is_in_flight()).cloned().collect();
        in_flight.sort_by_key(|s| (s.updated_at, s.id));
        in_flight.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(in_flight)
    }

    async fn record_carrier_order(&self, shipment_id: Uuid, order: &CarrierOrder, now: DateTime<Utc>) -> Result<Shipment> {
        let mut state = self.state.lock().await;
        let mut shipment = state.shipments.get(&shipment_id).cloned().ok_or(ShipmentError::NotFound)?;
        let from = shipment.status;
        shipment.record_carrier_order(order, now)?;
        let to = shipment.status;
        state.with_fulfilment(shipment.sub_order_id, |f| f.on_shipment_transition(shipment.sub_order_id, from, to, now))?;
        state.shipments.insert(shipment.id, shipment.clone());
        Ok(shipment)
    }

    async fn record_carrier_failure(&self, shipment_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let shipment = state.shipments.get_mut(&shipment_id).ok_or(ShipmentError::NotFound)?;
        shipment.record_carrier_failure(error, now);
        Ok(())
    }

    async fn apply_carrier_update(&self, shipment_id: Uuid, update: &CarrierUpdate, now: DateTime<Utc>) -> Result<AppliedUpdate> {
        let mut state = self.state.lock().await;
        let mut shipment = state.shipments.get(&shipment_id).cloned().ok_or(ShipmentError::NotFound)?;
        let key = update_key(shipment_id, update);
        if state.processed_updates.contains(&key) {
            return Ok(AppliedUpdate { outcome: ShipmentUpdateOutcome::Duplicate, shipment, payment_completed: None });
        }

        let outcome = shipment.apply(update, now);
        let mut payment_completed = None;
        if let ShipmentUpdateOutcome::Applied { from, to } = outcome {
            let sub_order_id = shipment.sub_order_id;
            let effects = state.with_fulfilment(sub_order_id, |f| f.on_shipment_transition(sub_order_id, from, to, now))?;
            if effects.payment_completed {
                let order_id = state.sub_orders.get(&sub_order_id).map(|s| s.order_id).ok_or(OrderError::SubOrderNotFound)?;
                payment_completed = state.payments.get(&order_id).cloned();
            }
        }
        state.processed_updates.insert(key);
        state.shipments.insert(shipment.id, shipment.clone());
        Ok(AppliedUpdate { outcome, shipment, payment_completed })
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn payment_by_txn_ref(&self, txn_ref: &str) -> Result<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.values().find(|p| p.txn_ref == txn_ref).cloned())
    }

    async fn record_gateway_result(&self, confirmation: &GatewayConfirmation, now: DateTime<Utc>) -> Result<(Payment, PaymentOutcome)> {
        let mut state = self.state.lock().await;
        let payment = state.payments.values_mut().find(|p| p.txn_ref == confirmation.txn_ref).ok_or(PaymentError::NotFound)?;
        let outcome = payment.apply_confirmation(confirmation, now)?;
        Ok((payment.clone(), outcome))
    }
}

impl State {
    fn eligible(&self, store_id: Uuid, period: &SettlementPeriod) -> Vec<EligibleSubOrder> {
        let mut eligible: Vec<EligibleSubOrder> = self.sub_orders.values()
            .filter(|s| is_eligible(s, store_id, period))
            .filter_map(|s| self.orders.get(&s.order_id).map(|o| EligibleSubOrder { sub_order: s.clone(), order_code: o.code.clone() }))
            .collect();
        eligible.sort_by_key(|e| (e.sub_order.completed_at, e.sub_order.id));
        eligible
    }

    fn settlement_detail(&self, settlement: &Settlement) -> SettlementDetail {
        let items = self.settlement_items.iter().filter(|i| i.settlement_id == settlement.id).cloned().collect();
        let mut refunds: Vec<Refund> = self.refunds.values().filter(|r| r.settlement_id == Some(settlement.id)).cloned().collect();
        refunds.sort_by_key(|r| r.id);
        SettlementDetail { settlement: settlement.clone(), items, refunds }
    }
}

#[async_trait]
impl SettlementRepository for MemoryStore {
    async fn eligible_sub_orders(&self, store_id: Uuid, period: &SettlementPeriod) -> Result<Vec<EligibleSubOrder>> {
        Ok(self.state.lock().await.eligible(store_id, period))
    }

    async fn create_settlement(&self, store_id: Uuid, period: &SettlementPeriod, commission_rate: Decimal, now: DateTime<Utc>) -> Result<SettlementDetail> {
        let mut state = self.state.lock().await;
        let eligible = state.eligible(store_id, period);
        let refunds: Vec<Refund> = state.refunds.values().filter(|r| r.store_id == store_id && r.is_settleable()).cloned().collect();
        let (settlement, items) = Settlement::build(store_id, *period, commission_rate, &eligible, &refunds, now)?;

        for entry in &eligible {
            if let Some(sub) = state.sub_orders.get_mut(&entry.sub_order.id) { sub.settlement_id = Some(settlement.id); }
        }
        for refund in &refunds {
            if let Some(r) = state.refunds.get_mut(&refund.id) { r.settlement_id = Some(settlement.id); }
        }
        state.settlement_items.extend(items);
        state.settlements.insert(settlement.id, settlement.clone());
        Ok(state.settlement_detail(&settlement))
    }

    async fn settlement(&self, id: Uuid) -> Result<Option<SettlementDetail>> {
        let state = self.state.lock().await;
        Ok(state.settlements.get(&id).map(|s| state.settlement_detail(s)))
    }

    async fn settlements_for_store(&self, store_id: Uuid) -> Result<Vec<Settlement>> {
        let state = self.state.lock().await;
        let mut settlements: Vec<Settlement> = state.settlements.values().filter(|s| s.store_id == store_id).cloned().collect();
        settlements.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(settlements)
    }

    async fn mark_settlement_paid(&self, id: Uuid, reference: &str, now: DateTime<Utc>) -> Result<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state.settlements.get_mut(&id).ok_or(SettlementError::NotFound)?;
        settlement.mark_paid(reference, now)?;
        Ok(settlement.clone())
    }

    async fn cancel_settlement(&self, id: Uuid) -> Result<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state.settlements.get_mut(&id).ok_or(SettlementError::NotFound)?;
        settlement.cancel()?;
        let settlement = settlement.clone();
        for sub in state.sub_orders.values_mut().filter(|s| s.settlement_id == Some(id)) { sub.settlement_id = None; }
        for refund in state.refunds.values_mut().filter(|r| r.settlement_id == Some(id)) { refund.settlement_id = None; }
        Ok(settlement)
    }

    async fn request_refund(&self, sub_order_id: Uuid, amount: Money, reason: &str, now: DateTime<Utc>) -> Result<Refund> {
        let mut state = self.state.lock().await;
        let sub = state.sub_orders.get(&sub_order_id).ok_or(OrderError::SubOrderNotFound)?;
        let existing: Vec<Refund> = state.refunds.values().filter(|r| r.sub_order_id == sub_order_id).cloned().collect();
        let refund = Refund::request(sub, amount, reason, &existing, now)?;
        state.refunds.insert(refund.id, refund.clone());
        Ok(refund)
    }

    async fn decide_refund(&self, refund_id: Uuid, approve: bool, now: DateTime<Utc>) -> Result<Refund> {
        let mut state = self.state.lock().await;
        let refund = state.refunds.get_mut(&refund_id).ok_or(SettlementError::RefundNotFound)?;
        refund.decide(approve, now)?;
        Ok(refund.clone())
    }
}
