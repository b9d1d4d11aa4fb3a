//! Aggregates module
pub mod cart;
pub mod checkout;
pub mod lifecycle;
pub mod order;
pub mod payment;
pub mod settlement;
pub mod shipment;
pub mod variant;
pub mod voucher;

pub use cart::{Cart, CartError, CartLine};
pub use checkout::{CheckoutError, CheckoutPlan, CheckoutRequest, ReservedVoucher, ShippingQuote, StoreDraft, SubOrderPlan};
pub use lifecycle::{Fulfilment, TransitionEffects};
pub use order::{Order, OrderError, OrderItem, OrderStatus, SubOrder, SubOrderStatus};
pub use payment::{GatewayConfirmation, Payment, PaymentError, PaymentMethod, PaymentOutcome, PaymentStatus};
pub use settlement::{EligibleSubOrder, Refund, RefundStatus, Settlement, SettlementError, SettlementItem, SettlementPeriod, SettlementStatus};
pub use shipment::{CarrierOrder, CarrierUpdate, Shipment, ShipmentError, ShipmentStatus, ShipmentUpdateOutcome};
pub use variant::{Address, StockError, Variant};
pub use voucher::{Discount, ReservationStatus, Voucher, VoucherError, VoucherReservation, VoucherScope, VoucherUsage};
