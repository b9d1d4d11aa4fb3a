//! HTTP surface: buyer, admin and callback routes over [`Services`].
//!
//! Buyers are identified by the `X-User-Id` header set by the upstream gateway.

pub mod cart;
pub mod error;
pub mod extract;
pub mod orders;
pub mod payments;
pub mod settlements;
pub mod vouchers;
pub mod webhooks;

pub use error::{ApiError, ApiResult};

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;
use validator::Validate;
use crate::services::Services;
use crate::MarketplaceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState { pub services: Services }

/// Authenticated buyer.
#[derive(Clone, Copy, Debug)]
pub struct BuyerId(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BuyerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts.headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok())
            .ok_or_else(|| MarketplaceError::Forbidden("missing X-User-Id header".into()))?;
        let id = Uuid::parse_str(raw.trim()).map_err(|_| MarketplaceError::Validation("X-User-Id must be a UUID".into()))?;
        Ok(Self(id))
    }
}

pub(crate) fn validated<T: Validate>(input: T) -> ApiResult<T> {
    input.validate().map_err(|e| MarketplaceError::Validation(e.to_string()))?;
    Ok(input)
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header("x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("127.0.0.1")
        .to_string()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "service": "marketplace-lifecycle", "version": env!("CARGO_PKG_VERSION") }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/cart", get(cart::view).delete(cart::clear))
        .route("/api/v1/cart/items", post(cart::add_item))
        .route("/api/v1/cart/items/:variant_id", put(cart::set_quantity).delete(cart::remove_item))
        .route("/api/v1/vouchers", post(vouchers::create))
        .route("/api/v1/vouchers/reservations", post(vouchers::reserve))
        .route("/api/v1/vouchers/reservations/:id", axum::routing::delete(vouchers::release))
        .route("/api/v1/orders", get(orders::list).post(orders::place))
        .route("/api/v1/orders/:id", get(orders::detail))
        .route("/api/v1/sub-orders/:id/cancel", post(orders::cancel_sub_order))
        .route("/api/v1/sub-orders/:id/refunds", post(orders::request_refund))
        .route("/api/v1/refunds/:id/decision", post(settlements::decide_refund))
        .route("/api/v1/stores/:store_id/settlements", get(settlements::list).post(settlements::create))
        .route("/api/v1/stores/:store_id/settlements/eligible", get(settlements::eligible))
        .route("/api/v1/settlements/:id", get(settlements::detail))
        .route("/api/v1/settlements/:id/paid", post(settlements::mark_paid))
        .route("/api/v1/settlements/:id/cancel", post(settlements::cancel))
        .route("/webhooks/ghtk", post(webhooks::ghtk))
        .route("/payments/vnpay/ipn", get(payments::ipn))
        .route("/payments/vnpay/return", get(payments::vnpay_return))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;
    use uuid::Uuid;
    use super::{router, AppState, USER_ID_HEADER};
    use crate::testing::Fixture;

    pub fn app(f: &Fixture) -> Router { router(AppState { services: f.services.clone() }) }

    /// Send a request and return status plus decoded JSON body (`Null` when empty).
    pub async fn call(app: &Router, method: Method, uri: &str, user: Option<Uuid>, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user { builder = builder.header(USER_ID_HEADER, user.to_string()); }
        let request = match body {
            Some(json) => builder.header("content-type", "application/json").body(Body::from(json.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        send(app, request).await
    }

    pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() { serde_json::Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use super::test_support::{app, call};
    use crate::testing::fixture;

    #[tokio::test]
    async fn test_health() {
        let f = fixture().await;
        let (status, body) = call(&app(&f), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_buyer_header_required() {
        let f = fixture().await;
        let app = app(&f);
        let (status, body) = call(&app, Method::GET, "/api/v1/cart", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");

        let request = axum::http::Request::builder().uri("/api/v1/cart").header(USER_ID_HEADER, "not-a-uuid")
            .body(axum::body::Body::empty()).unwrap();
        let (status, _) = super::test_support::send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "127.0.0.1");
        headers.insert("x-real-ip", "198.51.100.4".parse().unwrap());
        assert_eq!(client_ip(&headers), "198.51.100.4");
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }
}
