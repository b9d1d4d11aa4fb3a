//! Cross-aggregate consequences of a shipment moving.
//!
//! When a shipment changes state, its sub-order follows, the order status is derived
//! again, and the payment may be collected (COD) or need a refund (cancelled after
//! payment). Both stores run these rules inside the same transaction as the shipment
//! update.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use crate::domain::aggregates::order::{Order, OrderError, SubOrder, SubOrderStatus};
use crate::domain::aggregates::payment::{Payment, PaymentMethod, PaymentOutcome, PaymentStatus};
use crate::domain::aggregates::settlement::Refund;
use crate::domain::aggregates::shipment::{Shipment, ShipmentStatus};

/// An order with everything a shipment transition can touch.
pub struct Fulfilment<'a> {
    pub order: &'a mut Order,
    pub sub_orders: &'a mut [SubOrder],
    pub payment: &'a mut Payment,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransitionEffects {
    pub sub_order_changed: bool,
    pub order_changed: bool,
    /// Put the sub-order's items back into stock.
    pub restore_stock: bool,
    /// COD collected: the payment just became Paid.
    pub payment_completed: bool,
    pub refund: Option<Refund>,
}

/// COD is collected once every sub-order that still ships has reached the buyer.
fn cod_collected(statuses: &[SubOrderStatus]) -> bool {
    let shipping: Vec<&SubOrderStatus> = statuses.iter()
        .filter(|s| !matches!(s, SubOrderStatus::Cancelled | SubOrderStatus::Returned))
        .collect();
    !shipping.is_empty() && shipping.iter().all(|s| matches!(s, SubOrderStatus::Delivered | SubOrderStatus::Completed))
}

impl<'a> Fulfilment<'a> {
    fn statuses(&self) -> Vec<SubOrderStatus> { self.sub_orders.iter().map(|s| s.status).collect() }

    fn position(&self, sub_order_id: Uuid) -> Result<usize, OrderError> {
        self.sub_orders.iter().position(|s| s.id == sub_order_id).ok_or(OrderError::SubOrderNotFound)
    }

    /// Apply the consequences of `sub_order_id`'s shipment moving `from` → `to`.
    pub fn on_shipment_transition(&mut self, sub_order_id: Uuid, from: ShipmentStatus, to: ShipmentStatus, now: DateTime<Utc>) -> Result<TransitionEffects, OrderError> {
        let idx = self.position(sub_order_id)?;
        let mut effects = TransitionEffects {
            sub_order_changed: self.sub_orders[idx].follow_shipment(to.sub_order_status(), now),
            ..TransitionEffects::default()
        };

        if effects.sub_order_changed && matches!(to, ShipmentStatus::Cancelled | ShipmentStatus::Lost | ShipmentStatus::Returned) {
            effects.restore_stock = to == ShipmentStatus::Cancelled && from.before_pickup();
            let share = self.sub_orders[idx].total;
            if !self.payment.release_share(share, now) {
                effects.refund = Some(Refund::for_cancellation(&self.sub_orders[idx], now));
            }
        }

        let statuses = self.statuses();
        effects.order_changed = self.order.touch(&statuses, now);

        if self.payment.method == PaymentMethod::Cod && self.payment.status == PaymentStatus::Pending && cod_collected(&statuses) {
            let amount = self.payment.amount;
            // Amount is the payment's own, mark_paid cannot mismatch here.
            if let Ok(PaymentOutcome::Paid) = self.payment.mark_paid(amount, None, now) {
                effects.payment_completed = true;
            }
        }
        Ok(effects)
    }

    /// Buyer-initiated cancellation of one sub-order before the carrier picks it up.
    pub fn cancel_sub_order(&mut self, sub_order_id: Uuid, user_id: Uuid, shipment: &mut Shipment, now: DateTime<Utc>) -> Result<TransitionEffects, OrderError> {
        if self.order.user_id != user_id { return Err(OrderError::NotOwner); }
        let idx = self.position(sub_order_id)?;
        if shipment.sub_order_id != self.sub_orders[idx].id { return Err(OrderError::SubOrderNotFound); }
        let from = shipment.cancel(now).map_err(|_| OrderError::NotCancellable(shipment.status.as_str().to_string()))?;
        self.on_shipment_transition(sub_order_id, from, ShipmentStatus::Cancelled, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::OrderStatus;
    use crate::domain::aggregates::variant::Address;
    use crate::domain::value_objects::Money;

    struct Fixture { order: Order, subs: Vec<SubOrder>, payment: Payment }

    fn fixture(method: PaymentMethod) -> Fixture {
        let now = Utc::now();
        let order_id = Uuid::now_v7();
        let sub = |total: i64| SubOrder {
            id: Uuid::now_v7(), order_id, store_id: Uuid::now_v7(), status: SubOrderStatus::Confirmed,
            items_subtotal: Money::vnd(total), shipping_fee: Money::ZERO, store_discount: Money::ZERO,
            platform_discount: Money::ZERO, shipping_discount: Money::ZERO, total: Money::vnd(total),
            completed_at: None, settlement_id: None, created_at: now, updated_at: now,
        };
        let subs = vec![sub(100_000), sub(50_000)];
        let order = Order {
            id: order_id, code: "ORD-00000001".into(), user_id: Uuid::now_v7(), status: OrderStatus::Pending,
            items_subtotal: Money::vnd(150_000), shipping_total: Money::ZERO, discount_total: Money::ZERO,
            grand_total: Money::vnd(150_000), payment_method: method, shipping_address: Address::default(),
            note: None, idempotency_key: None, created_at: now, updated_at: now,
        };
        let payment = Payment::pending(order_id, method, Money::vnd(150_000), now);
        Fixture { order, subs, payment }
    }

    #[test]
    fn test_cod_collected_when_all_shipping_sub_orders_delivered() {
        let mut f = fixture(PaymentMethod::Cod);
        let (first, second) = (f.subs[0].id, f.subs[1].id);
        let mut ful = Fulfilment { order: &mut f.order, sub_orders: &mut f.subs, payment: &mut f.payment };
        let e = ful.on_shipment_transition(first, ShipmentStatus::Delivering, ShipmentStatus::Delivered, Utc::now()).unwrap();
        assert!(e.sub_order_changed && !e.payment_completed);
        assert_eq!(ful.order.status, OrderStatus::Processing);
        let e = ful.on_shipment_transition(second, ShipmentStatus::PickingUp, ShipmentStatus::Cancelled, Utc::now()).unwrap();
        assert!(e.restore_stock);
        assert!(e.payment_completed);
        assert_eq!(ful.payment.amount, Money::vnd(100_000));
        assert_eq!(ful.payment.status, PaymentStatus::Paid);
    }

    #[test]
    fn test_cancel_after_online_payment_opens_refund() {
        let mut f = fixture(PaymentMethod::Vnpay);
        f.payment.mark_paid(Money::vnd(150_000), Some("1".into()), Utc::now()).unwrap();
        let user = f.order.user_id;
        let sub_id = f.subs[1].id;
        let mut shipment = Shipment::pending(sub_id, "ghtk", Address::default(), Address::default(), 100, Money::ZERO, Money::ZERO, Money::ZERO, Utc::now());
        let mut ful = Fulfilment { order: &mut f.order, sub_orders: &mut f.subs, payment: &mut f.payment };
        assert_eq!(ful.cancel_sub_order(sub_id, Uuid::now_v7(), &mut shipment, Utc::now()), Err(OrderError::NotOwner));
        let e = ful.cancel_sub_order(sub_id, user, &mut shipment, Utc::now()).unwrap();
        let refund = e.refund.unwrap();
        assert_eq!(refund.amount, Money::vnd(50_000));
        assert!(!refund.chargeable_to_store);
        assert!(e.restore_stock);
        assert_eq!(shipment.status, ShipmentStatus::Cancelled);
        assert!(matches!(ful.cancel_sub_order(sub_id, user, &mut shipment, Utc::now()), Err(OrderError::NotCancellable(_))));
    }

    #[test]
    fn test_completed_sub_order_records_completion() {
        let mut f = fixture(PaymentMethod::Vnpay);
        let sub_id = f.subs[0].id;
        let now = Utc::now();
        let mut ful = Fulfilment { order: &mut f.order, sub_orders: &mut f.subs, payment: &mut f.payment };
        ful.on_shipment_transition(sub_id, ShipmentStatus::Delivered, ShipmentStatus::Completed, now).unwrap();
        assert_eq!(ful.sub_orders[0].status, SubOrderStatus::Completed);
        assert_eq!(ful.sub_orders[0].completed_at, Some(now));
    }
}
