//! Marketplace Lifecycle
//!
//! Order → payment → shipment → settlement lifecycle of a multi-store marketplace.
//!
//! ## Features
//! - Cart split into per-store sub-orders with atomic stock decrement
//! - Voucher reservation with per-voucher and per-user limits
//! - GHTK carrier integration: fee quotes, order creation, webhook and polling sync
//! - COD and VNPAY payments
//! - Store settlements and refunds

pub mod api;
pub mod carrier;
pub mod config;
pub mod domain;
pub mod messaging;
pub mod services;
pub mod store;
pub mod vnpay;
pub mod workers;

use thiserror::Error;
use crate::domain::aggregates::{
    CartError, CheckoutError, OrderError, PaymentError, SettlementError, ShipmentError, StockError, VoucherError,
};
use crate::domain::value_objects::VoucherCodeError;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Cart(#[from] CartError),

    #[error(transparent)]
    Stock(#[from] StockError),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Voucher(#[from] VoucherError),

    #[error(transparent)]
    VoucherCode(#[from] VoucherCodeError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Shipment(#[from] ShipmentError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error("carrier error: {0}")]
    Carrier(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, MarketplaceError>;

#[cfg(test)]
pub(crate) mod testing;
