//! Application services: orchestration between the store, the carrier, the payment
//! gateway and the event bus. Rules live in the domain; these only sequence calls.

pub mod cart;
pub mod checkout;
pub mod order;
pub mod payment;
pub mod settlement;
pub mod shipment;
pub mod voucher;

pub use cart::{CartLineView, CartService, CartView};
pub use checkout::{CheckoutService, PlaceOrder, PlacedOrder};
pub use order::OrderService;
pub use payment::{PaymentReturn, PaymentService};
pub use settlement::SettlementService;
pub use shipment::{ShipmentService, SyncReport};
pub use voucher::{NewVoucher, VoucherService};

use chrono::Duration;
use rust_decimal::Decimal;
use std::sync::Arc;
use crate::carrier::DynCarrier;
use crate::messaging::DynPublisher;
use crate::store::DynStore;
use crate::vnpay::VnpayGateway;

#[derive(Clone, Debug)]
pub struct Settings {
    pub reservation_ttl: Duration,
    pub commission_rate: Decimal,
    pub ghtk_webhook_token: String,
}

#[derive(Clone)]
pub struct Services {
    pub carts: CartService,
    pub vouchers: VoucherService,
    pub checkout: CheckoutService,
    pub orders: OrderService,
    pub shipments: ShipmentService,
    pub payments: PaymentService,
    pub settlements: SettlementService,
}

impl Services {
    pub fn new(store: DynStore, carrier: DynCarrier, publisher: DynPublisher, gateway: VnpayGateway, settings: Settings) -> Self {
        let gateway = Arc::new(gateway);
        let shipments = ShipmentService::new(store.clone(), carrier.clone(), publisher.clone(), settings.ghtk_webhook_token);
        Self {
            carts: CartService::new(store.clone()),
            vouchers: VoucherService::new(store.clone(), settings.reservation_ttl),
            checkout: CheckoutService::new(store.clone(), carrier.clone(), publisher.clone(), gateway.clone(), shipments.clone()),
            orders: OrderService::new(store.clone(), carrier, publisher.clone()),
            payments: PaymentService::new(store.clone(), gateway, publisher.clone()),
            settlements: SettlementService::new(store, publisher, settings.commission_rate),
            shipments,
        }
    }
}
