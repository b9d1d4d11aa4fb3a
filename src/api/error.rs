//! HTTP mapping of [`MarketplaceError`]: `{ "error": <code>, "message": <text> }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use crate::domain::aggregates::{
    CartError, CheckoutError, OrderError, PaymentError, SettlementError, ShipmentError, VoucherError,
};
use crate::MarketplaceError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(pub MarketplaceError);

impl<E: Into<MarketplaceError>> From<E> for ApiError {
    fn from(e: E) -> Self { Self(e.into()) }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

const BAD_REQUEST: (StatusCode, &str) = (StatusCode::BAD_REQUEST, "validation_failed");
const UNAUTHORIZED: (StatusCode, &str) = (StatusCode::UNAUTHORIZED, "unauthorized");
const FORBIDDEN: (StatusCode, &str) = (StatusCode::FORBIDDEN, "forbidden");
const NOT_FOUND: (StatusCode, &str) = (StatusCode::NOT_FOUND, "not_found");
const CONFLICT: (StatusCode, &str) = (StatusCode::CONFLICT, "conflict");
const BAD_GATEWAY: (StatusCode, &str) = (StatusCode::BAD_GATEWAY, "upstream_failed");
const INTERNAL: (StatusCode, &str) = (StatusCode::INTERNAL_SERVER_ERROR, "internal_error");

fn order_status(e: &OrderError) -> (StatusCode, &'static str) {
    match e {
        OrderError::NotFound | OrderError::SubOrderNotFound => NOT_FOUND,
        OrderError::NotOwner => FORBIDDEN,
        OrderError::NotCancellable(_) | OrderError::NotRefundable(_) | OrderError::DuplicateCode(_) => CONFLICT,
        OrderError::Corrupt(_) => INTERNAL,
    }
}

fn voucher_status(e: &VoucherError) -> (StatusCode, &'static str) {
    match e {
        VoucherError::NotFound | VoucherError::ReservationNotFound => NOT_FOUND,
        VoucherError::NotOwner => FORBIDDEN,
        VoucherError::Invalid(_) => BAD_REQUEST,
        VoucherError::Corrupt(_) => INTERNAL,
        _ => CONFLICT,
    }
}

impl ApiError {
    pub fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            MarketplaceError::NotFound(_) => NOT_FOUND,
            MarketplaceError::Validation(_) | MarketplaceError::VoucherCode(_) => BAD_REQUEST,
            MarketplaceError::Forbidden(_) => FORBIDDEN,
            MarketplaceError::Conflict(_) | MarketplaceError::Stock(_) => CONFLICT,
            MarketplaceError::Cart(CartError::ItemNotFound) => NOT_FOUND,
            MarketplaceError::Cart(CartError::InvalidQuantity) => BAD_REQUEST,
            MarketplaceError::Checkout(e) => match e {
                CheckoutError::EmptyCart => BAD_REQUEST,
                CheckoutError::UnknownVariant(_) => NOT_FOUND,
                CheckoutError::InsufficientStock { .. } => CONFLICT,
                CheckoutError::QuoteMismatch => INTERNAL,
                CheckoutError::Voucher(v) => voucher_status(v),
            },
            MarketplaceError::Voucher(e) => voucher_status(e),
            MarketplaceError::Order(e) => order_status(e),
            MarketplaceError::Shipment(e) => match e {
                ShipmentError::NotFound => NOT_FOUND,
                ShipmentError::AlreadyRegistered(_) | ShipmentError::NotCancellable(_) => CONFLICT,
                ShipmentError::Corrupt(_) => INTERNAL,
            },
            MarketplaceError::Payment(e) => match e {
                PaymentError::NotFound => NOT_FOUND,
                PaymentError::InvalidSignature => UNAUTHORIZED,
                PaymentError::MalformedCallback(_) => BAD_REQUEST,
                PaymentError::AmountMismatch { .. } | PaymentError::InvalidTransition { .. } => CONFLICT,
                PaymentError::GatewayUnavailable => BAD_GATEWAY,
                PaymentError::Corrupt(_) => INTERNAL,
            },
            MarketplaceError::Settlement(e) => match e {
                SettlementError::NotFound | SettlementError::RefundNotFound => NOT_FOUND,
                SettlementError::InvalidPeriod | SettlementError::InvalidCommissionRate(_) | SettlementError::InvalidRefundAmount(_) => BAD_REQUEST,
                SettlementError::Order(inner) => order_status(inner),
                SettlementError::Corrupt(_) => INTERNAL,
                _ => CONFLICT,
            },
            MarketplaceError::Carrier(_) => BAD_GATEWAY,
            MarketplaceError::Storage(_) | MarketplaceError::Migration(_) => INTERNAL,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("❌ Request failed: {:?}", self.0);
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorBody { error: code, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::ShipmentStatus;
    use crate::domain::value_objects::Money;

    #[test]
    fn test_status_mapping() {
        let status = |e: MarketplaceError| ApiError(e).status().0;
        assert_eq!(status(MarketplaceError::NotFound("order")), StatusCode::NOT_FOUND);
        assert_eq!(status(CheckoutError::EmptyCart.into()), StatusCode::BAD_REQUEST);
        assert_eq!(status(VoucherError::UsageLimitReached.into()), StatusCode::CONFLICT);
        assert_eq!(status(CheckoutError::Voucher(VoucherError::ReservationNotFound).into()), StatusCode::NOT_FOUND);
        assert_eq!(status(ShipmentError::NotCancellable(ShipmentStatus::PickedUp).into()), StatusCode::CONFLICT);
        assert_eq!(status(OrderError::NotOwner.into()), StatusCode::FORBIDDEN);
        assert_eq!(status(PaymentError::InvalidSignature.into()), StatusCode::UNAUTHORIZED);
        assert_eq!(status(SettlementError::InvalidRefundAmount(Money::ZERO).into()), StatusCode::BAD_REQUEST);
        assert_eq!(status(SettlementError::Order(OrderError::SubOrderNotFound).into()), StatusCode::NOT_FOUND);
        assert_eq!(status(MarketplaceError::Carrier("timeout".into())), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_internal_errors_hide_details() {
        let response = ApiError(MarketplaceError::Storage(sqlx::Error::PoolTimedOut)).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "internal_error");
        assert_eq!(json["message"], "internal server error");
    }
}
