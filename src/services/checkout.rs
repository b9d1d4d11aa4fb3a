//! CreateOrder: turn the buyer's cart into an order with one sub-order per store.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use crate::carrier::{DynCarrier, FeeRequest};
use crate::domain::aggregates::checkout::{build_plan, split_by_store};
use crate::domain::aggregates::order::generate_order_code;
use crate::domain::aggregates::{
    Address, CheckoutError, CheckoutPlan, CheckoutRequest, OrderError, PaymentMethod, PaymentStatus, ReservedVoucher, ShippingQuote, StoreDraft,
    VoucherError,
};
use crate::domain::events::DomainEvent;
use crate::messaging::DynPublisher;
use crate::store::{DynStore, OrderDetail};
use crate::vnpay::VnpayGateway;
use crate::{MarketplaceError, Result};
use super::ShipmentService;

const ORDER_CODE_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug)]
pub struct PlaceOrder {
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub payment_method: PaymentMethod,
    pub order_voucher: Option<Uuid>,
    pub shipping_voucher: Option<Uuid>,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
    pub client_ip: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlacedOrder {
    #[serde(flatten)]
    pub detail: OrderDetail,
    /// VNPAY redirect while the payment is still open.
    pub payment_url: Option<String>,
    /// True when an earlier request with the same idempotency key created the order.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: DynStore,
    carrier: DynCarrier,
    publisher: DynPublisher,
    gateway: Arc<VnpayGateway>,
    shipments: ShipmentService,
}

impl CheckoutService {
    pub fn new(store: DynStore, carrier: DynCarrier, publisher: DynPublisher, gateway: Arc<VnpayGateway>, shipments: ShipmentService) -> Self {
        Self { store, carrier, publisher, gateway, shipments }
    }

    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<PlacedOrder> {
        let now = Utc::now();
        if let Some(existing) = self.replay(&cmd).await? { return self.placed(existing, &cmd.client_ip, true, now); }

        let cart = self.store.load_cart(cmd.user_id).await?;
        if cart.is_empty() { return Err(CheckoutError::EmptyCart.into()); }
        let ids: Vec<Uuid> = cart.lines().iter().map(|l| l.variant_id).collect();
        let variants: HashMap<Uuid, _> = self.store.variants(&ids).await?.into_iter().map(|v| (v.id, v)).collect();
        let drafts = split_by_store(cart.lines(), &variants)?;

        let delivery = self.store.user_address(cmd.user_id, cmd.address_id).await?;
        let quotes = try_join_all(drafts.iter().map(|draft| self.quote(draft, &delivery))).await?;

        let request = CheckoutRequest {
            user_id: cmd.user_id,
            shipping_address: delivery,
            payment_method: cmd.payment_method,
            note: cmd.note.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            order_voucher: self.reserved(cmd.order_voucher, cmd.user_id, now).await?,
            shipping_voucher: self.reserved(cmd.shipping_voucher, cmd.user_id, now).await?,
        };
        let mut plan = build_plan(&request, &drafts, &quotes, self.carrier.name(), now)?;

        match self.commit(&mut plan, now).await {
            Ok(()) => {}
            // Lost a race against a retry carrying the same key.
            Err(MarketplaceError::Conflict(reason)) if cmd.idempotency_key.is_some() => {
                return match self.replay(&cmd).await? {
                    Some(existing) => self.placed(existing, &cmd.client_ip, true, now),
                    None => Err(MarketplaceError::Conflict(reason)),
                };
            }
            Err(e) => return Err(e),
        }
        info!(
            order_id = %plan.order.id, code = %plan.order.code, user_id = %cmd.user_id,
            sub_orders = plan.sub_orders.len(), grand_total = plan.order.grand_total.amount(),
            "🛒 Order placed"
        );
        self.publisher.publish(&DomainEvent::OrderCreated {
            order_id: plan.order.id,
            code: plan.order.code.clone(),
            user_id: plan.order.user_id,
            sub_order_ids: plan.sub_orders.iter().map(|s| s.sub_order.id).collect(),
            grand_total: plan.order.grand_total,
        }).await;

        for sub_plan in &plan.sub_orders {
            if let Err(e) = self.shipments.dispatch(&sub_plan.shipment).await {
                warn!(shipment_id = %sub_plan.shipment.id, "Carrier order deferred to retry: {e}");
            }
        }

        let detail = self.store.order_detail(plan.order.id).await?.ok_or(MarketplaceError::NotFound("order"))?;
        self.placed(detail, &cmd.client_ip, false, now)
    }

    /// Commit the plan, drawing a fresh order code whenever the current one is taken.
    pub(crate) async fn commit(&self, plan: &mut CheckoutPlan, now: DateTime<Utc>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.commit_checkout(plan, now).await {
                Err(MarketplaceError::Order(OrderError::DuplicateCode(code))) if attempt < ORDER_CODE_ATTEMPTS => {
                    warn!(code = %code, attempt, "Order code collision, drawing a new one");
                    plan.order.code = generate_order_code();
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn replay(&self, cmd: &PlaceOrder) -> Result<Option<OrderDetail>> {
        let Some(key) = cmd.idempotency_key.as_deref() else { return Ok(None) };
        let existing = self.store.order_by_idempotency_key(cmd.user_id, key).await?;
        if let Some(detail) = &existing {
            info!(order_id = %detail.order.id, idempotency_key = key, "Checkout replayed");
        }
        Ok(existing)
    }

    async fn quote(&self, draft: &StoreDraft, delivery: &Address) -> Result<ShippingQuote> {
        let pickup = self.store.store_address(draft.store_id).await?;
        let request = FeeRequest {
            pickup: pickup.clone(),
            delivery: delivery.clone(),
            weight_grams: draft.weight_grams(),
            declared_value: draft.items_subtotal(),
        };
        let fee = self.carrier.quote_fee(&request).await?;
        Ok(ShippingQuote { store_id: draft.store_id, pickup, fee })
    }

    async fn reserved(&self, reservation_id: Option<Uuid>, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<ReservedVoucher>> {
        let Some(reservation_id) = reservation_id else { return Ok(None) };
        let (reservation, voucher) = self.store.reservation(reservation_id).await?.ok_or(VoucherError::ReservationNotFound)?;
        reservation.ensure_consumable(user_id, now)?;
        Ok(Some(ReservedVoucher { reservation_id, voucher }))
    }

    fn placed(&self, detail: OrderDetail, client_ip: &str, replayed: bool, now: DateTime<Utc>) -> Result<PlacedOrder> {
        let payment = &detail.payment;
        let open = matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Failed);
        let payment_url = if payment.method == PaymentMethod::Vnpay && open && !payment.amount.is_zero() {
            Some(self.gateway.payment_url(payment, &detail.order.code, client_ip, now)?)
        } else {
            None
        };
        Ok(PlacedOrder { detail, payment_url, replayed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Discount, ShipmentStatus, SubOrderStatus, VoucherScope};
    use crate::domain::value_objects::Money;
    use crate::store::{CartRepository, CatalogRepository, OrderRepository, VoucherRepository};
    use crate::testing::{address, fixture, voucher, Fixture};

    fn cmd(f: &Fixture, method: PaymentMethod) -> PlaceOrder {
        PlaceOrder {
            user_id: f.buyer, address_id: f.address_id, payment_method: method, order_voucher: None,
            shipping_voucher: None, note: Some("Giao giờ hành chính".into()), idempotency_key: None,
            client_ip: "203.0.113.7".into(),
        }
    }

    async fn stock_of(f: &Fixture, id: Uuid) -> u32 { f.store.variants(&[id]).await.unwrap()[0].stock() }

    #[tokio::test]
    async fn test_taken_order_code_is_redrawn() {
        let f = fixture().await;
        f.services.carts.add_item(f.buyer, f.shirt.id, 1).await.unwrap();
        let first = f.services.checkout.place_order(cmd(&f, PaymentMethod::Cod)).await.unwrap().detail;

        f.services.carts.add_item(f.buyer, f.mug.id, 1).await.unwrap();
        let cart = f.store.load_cart(f.buyer).await.unwrap();
        let variants: HashMap<Uuid, _> = f.store.variants(&[f.mug.id]).await.unwrap().into_iter().map(|v| (v.id, v)).collect();
        let drafts = split_by_store(cart.lines(), &variants).unwrap();
        let quotes = vec![ShippingQuote { store_id: f.store_a, pickup: address("Shop A", "Quận 1", "TP. Hồ Chí Minh"), fee: Money::vnd(22_000) }];
        let request = CheckoutRequest {
            user_id: f.buyer, shipping_address: address("Trần Thị B", "Quận 3", "TP. Hồ Chí Minh"),
            payment_method: PaymentMethod::Cod, note: None, idempotency_key: None, order_voucher: None, shipping_voucher: None,
        };
        let now = Utc::now();
        let mut plan = build_plan(&request, &drafts, &quotes, "sandbox", now).unwrap();
        plan.order.code = first.order.code.clone();

        assert!(matches!(
            f.store.commit_checkout(&plan, now).await,
            Err(MarketplaceError::Order(OrderError::DuplicateCode(code))) if code == first.order.code
        ));
        f.services.checkout.commit(&mut plan, now).await.unwrap();
        assert_ne!(plan.order.code, first.order.code);

        let orders = f.services.orders.orders_for_user(f.buyer).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders.iter().filter(|o| o.order.code == first.order.code).count(), 1);
        assert_eq!(stock_of(&f, f.mug.id).await, 9);
    }

    #[tokio::test]
    async fn test_checkout_splits_by_store_and_books_carrier() {
        let f = fixture().await;
        f.services.carts.add_item(f.buyer, f.shirt.id, 2).await.unwrap();
        f.services.carts.add_item(f.buyer, f.lamp.id, 1).await.unwrap();
        f.services.carts.add_item(f.buyer, f.mug.id, 1).await.unwrap();

        let placed = f.services.checkout.place_order(cmd(&f, PaymentMethod::Cod)).await.unwrap();
        let detail = &placed.detail;
        assert!(!placed.replayed);
        assert_eq!(placed.payment_url, None);
        assert_eq!(detail.sub_orders.len(), 2);
        assert_eq!(detail.order.items_subtotal, Money::vnd(2 * 150_000 + 300_000 + 50_000));
        assert_eq!(detail.order.grand_total, detail.sub_orders.iter().map(|s| s.sub_order.total).sum());
        assert_eq!(detail.payment.amount, detail.order.grand_total);
        for sub in &detail.sub_orders {
            assert_eq!(sub.shipment.status, ShipmentStatus::Created);
            assert!(sub.shipment.label.is_some());
            assert_eq!(sub.sub_order.status, SubOrderStatus::Confirmed);
            assert_eq!(sub.shipment.cod_amount, sub.sub_order.total);
        }

        assert_eq!(stock_of(&f, f.shirt.id).await, 3);
        assert_eq!(stock_of(&f, f.lamp.id).await, 1);
        assert!(f.store.load_cart(f.buyer).await.unwrap().is_empty());
        assert_eq!(f.publisher.kinds().first().copied(), Some("order_created"));
    }

    #[tokio::test]
    async fn test_insufficient_stock_changes_nothing() {
        let f = fixture().await;
        f.services.carts.add_item(f.buyer, f.shirt.id, 1).await.unwrap();
        f.services.carts.add_item(f.buyer, f.lamp.id, 3).await.unwrap();
        let err = f.services.checkout.place_order(cmd(&f, PaymentMethod::Cod)).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Checkout(CheckoutError::InsufficientStock { requested: 3, available: 2, .. })));
        assert_eq!(stock_of(&f, f.shirt.id).await, 5);
        assert_eq!(f.store.load_cart(f.buyer).await.unwrap().lines().len(), 2);
        assert!(f.publisher.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_vouchers_are_allocated_and_consumed() {
        let f = fixture().await;
        let platform = voucher("SALE10", VoucherScope::Order, Discount::Percentage(rust_decimal::Decimal::new(10, 0)), None);
        let freeship = voucher("FREESHIP", VoucherScope::Shipping, Discount::Fixed(Money::vnd(1_000_000)), None);
        f.store.create_voucher(&platform).await.unwrap();
        f.store.create_voucher(&freeship).await.unwrap();
        f.services.carts.add_item(f.buyer, f.shirt.id, 1).await.unwrap();
        f.services.carts.add_item(f.buyer, f.lamp.id, 1).await.unwrap();

        let order_hold = f.services.vouchers.reserve(f.buyer, "SALE10", None).await.unwrap();
        let ship_hold = f.services.vouchers.reserve(f.buyer, "FREESHIP", Some(Money::vnd(60_000))).await.unwrap();
        let placed = f.services.checkout.place_order(PlaceOrder {
            order_voucher: Some(order_hold.id), shipping_voucher: Some(ship_hold.id), ..cmd(&f, PaymentMethod::Vnpay)
        }).await.unwrap();

        let order = &placed.detail.order;
        let platform_discount: Money = placed.detail.sub_orders.iter().map(|s| s.sub_order.platform_discount).sum();
        let shipping_discount: Money = placed.detail.sub_orders.iter().map(|s| s.sub_order.shipping_discount).sum();
        assert_eq!(platform_discount, Money::vnd(45_000));
        assert_eq!(shipping_discount, order.shipping_total);
        assert_eq!(order.grand_total, Money::vnd(450_000 - 45_000));
        assert!(placed.payment_url.as_deref().is_some_and(|u| u.contains("vnp_Amount=40500000")));

        let (consumed, _) = f.store.reservation(order_hold.id).await.unwrap().unwrap();
        assert_eq!(consumed.order_id, Some(order.id));
        // A consumed hold cannot be spent twice.
        f.services.carts.add_item(f.buyer, f.mug.id, 1).await.unwrap();
        let again = f.services.checkout.place_order(PlaceOrder { order_voucher: Some(order_hold.id), ..cmd(&f, PaymentMethod::Cod) }).await;
        assert!(matches!(again, Err(MarketplaceError::Voucher(VoucherError::ReservationNotActive))));
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_order() {
        let f = fixture().await;
        f.services.carts.add_item(f.buyer, f.mug.id, 2).await.unwrap();
        let keyed = PlaceOrder { idempotency_key: Some("checkout-42".into()), ..cmd(&f, PaymentMethod::Vnpay) };
        let first = f.services.checkout.place_order(keyed.clone()).await.unwrap();
        let second = f.services.checkout.place_order(keyed).await.unwrap();
        assert!(second.replayed);
        assert_eq!(first.detail.order.id, second.detail.order.id);
        assert!(second.payment_url.is_some());
        assert_eq!(stock_of(&f, f.mug.id).await, 8);
    }

    #[tokio::test]
    async fn test_carrier_outage_leaves_shipments_pending() {
        let f = fixture().await;
        f.carrier.reject_bookings(true);
        f.services.carts.add_item(f.buyer, f.mug.id, 1).await.unwrap();
        let placed = f.services.checkout.place_order(cmd(&f, PaymentMethod::Cod)).await.unwrap();
        let shipment = &placed.detail.sub_orders[0].shipment;
        assert_eq!(shipment.status, ShipmentStatus::Pending);
        assert!(shipment.label.is_none());
        assert!(shipment.last_error.is_some());
        assert_eq!(placed.detail.sub_orders[0].sub_order.status, SubOrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_empty_cart_rejected() {
        let f = fixture().await;
        let err = f.services.checkout.place_order(cmd(&f, PaymentMethod::Cod)).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Checkout(CheckoutError::EmptyCart)));
    }
}
