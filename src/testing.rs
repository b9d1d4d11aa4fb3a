//! Shared fixtures: an in-memory marketplace with two stores and three products.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use crate::carrier::{map_status, SandboxCarrier};
use crate::domain::aggregates::{Address, CarrierUpdate, Discount, PaymentMethod, Variant, Voucher, VoucherScope};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::{Money, VoucherCode};
use crate::messaging::EventPublisher;
use crate::services::{PlaceOrder, Services, Settings};
use crate::store::{MemoryStore, OrderDetail};
use crate::vnpay::{IpnResponse, VnpayGateway, SANDBOX_PAY_URL};

pub const WEBHOOK_TOKEN: &str = "ghtk-hook-secret";

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingPublisher {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(DomainEvent::kind).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &DomainEvent) { self.events.lock().unwrap().push(event.clone()); }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub carrier: Arc<SandboxCarrier>,
    pub publisher: Arc<RecordingPublisher>,
    pub gateway: VnpayGateway,
    pub services: Services,
    pub buyer: Uuid,
    pub address_id: Uuid,
    pub store_a: Uuid,
    pub store_b: Uuid,
    /// Store A, 150 000 ₫, 5 in stock.
    pub shirt: Variant,
    /// Store A, 50 000 ₫, 10 in stock.
    pub mug: Variant,
    /// Store B, 300 000 ₫, 2 in stock.
    pub lamp: Variant,
}

pub fn address(name: &str, district: &str, province: &str) -> Address {
    Address {
        name: name.into(), phone: "0901234567".into(), street: "12 Nguyễn Huệ".into(),
        ward: "Phường 1".into(), district: district.into(), province: province.into(),
    }
}

pub fn gateway() -> VnpayGateway {
    VnpayGateway::new("TESTTMN1", "TESTSECRET0123456789", SANDBOX_PAY_URL, "https://shop.example/payments/vnpay/return")
}

pub async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let carrier = Arc::new(SandboxCarrier::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let (buyer, address_id, store_a, store_b) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    let shirt = Variant::new(Uuid::now_v7(), store_a, "Áo thun cotton", "TSHIRT-M", Money::vnd(150_000), 250, 5);
    let mug = Variant::new(Uuid::now_v7(), store_a, "Cốc sứ", "MUG-01", Money::vnd(50_000), 400, 10);
    let lamp = Variant::new(Uuid::now_v7(), store_b, "Đèn bàn", "LAMP-01", Money::vnd(300_000), 1800, 2);
    for variant in [&shirt, &mug, &lamp] { store.add_variant(variant.clone()).await; }
    store.add_user_address(buyer, address_id, address("Trần Thị B", "Quận 3", "TP. Hồ Chí Minh")).await;
    store.add_store_address(store_a, address("Shop A", "Quận 1", "TP. Hồ Chí Minh")).await;
    store.add_store_address(store_b, address("Shop B", "Ba Đình", "Hà Nội")).await;

    let settings = Settings {
        reservation_ttl: Duration::minutes(15),
        commission_rate: Decimal::new(5, 2),
        ghtk_webhook_token: WEBHOOK_TOKEN.into(),
    };
    let services = Services::new(store.clone(), carrier.clone(), publisher.clone(), gateway(), settings);
    Fixture { store, carrier, publisher, gateway: gateway(), services, buyer, address_id, store_a, store_b, shirt, mug, lamp }
}

/// Active voucher without limits or minimum, valid from yesterday to tomorrow.
pub fn voucher(code: &str, scope: VoucherScope, discount: Discount, store_id: Option<Uuid>) -> Voucher {
    let now = Utc::now();
    Voucher {
        id: Uuid::now_v7(), code: VoucherCode::new(code).unwrap(), scope, discount, max_discount: None,
        min_order_value: Money::ZERO, usage_limit: None, per_user_limit: None, store_id,
        starts_at: now - Duration::days(1), ends_at: now + Duration::days(1), is_active: true,
    }
}

/// One shirt from store A and one lamp from store B.
pub async fn place_order(f: &Fixture, method: PaymentMethod) -> OrderDetail {
    f.services.carts.add_item(f.buyer, f.shirt.id, 1).await.unwrap();
    f.services.carts.add_item(f.buyer, f.lamp.id, 1).await.unwrap();
    let placed = f.services.checkout.place_order(PlaceOrder {
        user_id: f.buyer, address_id: f.address_id, payment_method: method, order_voucher: None,
        shipping_voucher: None, note: None, idempotency_key: None, client_ip: "127.0.0.1".into(),
    }).await.unwrap();
    placed.detail
}

/// Deliver a successful IPN for the order's full amount.
pub async fn pay_with_vnpay(f: &Fixture, detail: &OrderDetail) -> IpnResponse {
    let amount = (detail.payment.amount.amount() * 100).to_string();
    let params = f.gateway.signed_callback(&[
        ("vnp_TmnCode", "TESTTMN1"), ("vnp_TxnRef", detail.payment.txn_ref.as_str()), ("vnp_Amount", amount.as_str()),
        ("vnp_ResponseCode", "00"), ("vnp_TransactionStatus", "00"), ("vnp_TransactionNo", "14000001"),
    ]);
    f.services.payments.handle_ipn(&params).await
}

/// Walk every shipment of the order through pickup, delivery and completion.
pub async fn complete(f: &Fixture, detail: &OrderDetail) {
    for sub in &detail.sub_orders {
        let label = sub.shipment.label.clone().unwrap();
        for (offset, code) in [(1, 3), (2, 5), (3, 6)] {
            let update = CarrierUpdate {
                label: label.clone(), status_code: code, status: map_status(code),
                action_time: Utc::now() + Duration::seconds(offset), reason: None,
            };
            f.services.shipments.apply_update(&update).await.unwrap();
        }
    }
}
