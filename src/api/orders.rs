//! Checkout, order reads, cancellation and refund requests.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;
use crate::domain::aggregates::{PaymentMethod, Refund};
use crate::domain::value_objects::Money;
use crate::services::{PlaceOrder, PlacedOrder};
use crate::store::{CancelledSubOrder, OrderDetail};
use crate::MarketplaceError;
use super::extract::{AppJson, AppPath};
use super::{client_ip, validated, ApiResult, AppState, BuyerId, IDEMPOTENCY_KEY_HEADER};

#[derive(Debug, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub address_id: Uuid,
    pub payment_method: PaymentMethod,
    /// Reservation id of an order-scope voucher.
    pub order_voucher: Option<Uuid>,
    pub shipping_voucher: Option<Uuid>,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

fn idempotency_key(headers: &HeaderMap) -> ApiResult<Option<String>> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else { return Ok(None) };
    let key = value.to_str().map_err(|_| MarketplaceError::Validation("Idempotency-Key must be ASCII".into()))?.trim();
    if key.is_empty() || key.len() > 128 {
        return Err(MarketplaceError::Validation("Idempotency-Key must be 1-128 characters".into()).into());
    }
    Ok(Some(key.to_string()))
}

pub async fn place(State(s): State<AppState>, BuyerId(user): BuyerId, headers: HeaderMap, AppJson(req): AppJson<PlaceOrderRequest>) -> ApiResult<(StatusCode, Json<PlacedOrder>)> {
    let req = validated(req)?;
    let placed = s.services.checkout.place_order(PlaceOrder {
        user_id: user,
        address_id: req.address_id,
        payment_method: req.payment_method,
        order_voucher: req.order_voucher,
        shipping_voucher: req.shipping_voucher,
        note: req.note.filter(|n| !n.trim().is_empty()),
        idempotency_key: idempotency_key(&headers)?,
        client_ip: client_ip(&headers),
    }).await?;
    let status = if placed.replayed { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(placed)))
}

pub async fn list(State(s): State<AppState>, BuyerId(user): BuyerId) -> ApiResult<Json<Vec<OrderDetail>>> {
    Ok(Json(s.services.orders.orders_for_user(user).await?))
}

pub async fn detail(State(s): State<AppState>, BuyerId(user): BuyerId, AppPath(id): AppPath<Uuid>) -> ApiResult<Json<OrderDetail>> {
    Ok(Json(s.services.orders.order(user, id).await?))
}

pub async fn cancel_sub_order(State(s): State<AppState>, BuyerId(user): BuyerId, AppPath(id): AppPath<Uuid>) -> ApiResult<Json<CancelledSubOrder>> {
    Ok(Json(s.services.orders.cancel_sub_order(user, id).await?))
}

pub async fn request_refund(State(s): State<AppState>, BuyerId(user): BuyerId, AppPath(id): AppPath<Uuid>, AppJson(req): AppJson<RefundRequest>) -> ApiResult<(StatusCode, Json<Refund>)> {
    let req = validated(req)?;
    let refund = s.services.settlements.request_refund(user, id, Money::vnd(req.amount), &req.reason).await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::json;
    use crate::api::test_support::{app, call, send};
    use crate::api::USER_ID_HEADER;
    use crate::testing::fixture;

    #[tokio::test]
    async fn test_place_order_with_idempotency_key() {
        let f = fixture().await;
        let app = app(&f);
        f.services.carts.add_item(f.buyer, f.mug.id, 2).await.unwrap();
        let order = || {
            Request::builder().method(Method::POST).uri("/api/v1/orders")
                .header(USER_ID_HEADER, f.buyer.to_string())
                .header("content-type", "application/json")
                .header("idempotency-key", "cart-7f3a")
                .header("x-forwarded-for", "203.0.113.9")
                .body(Body::from(json!({ "address_id": f.address_id, "payment_method": "vnpay" }).to_string()))
                .unwrap()
        };

        let (status, body) = send(&app, order()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["replayed"], false);
        assert!(body["payment_url"].as_str().is_some_and(|u| u.contains("vnp_IpAddr=203.0.113.9")));
        assert_eq!(body["sub_orders"].as_array().map(Vec::len), Some(1));

        let (status, again) = send(&app, order()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["replayed"], true);
        assert_eq!(again["order"]["id"], body["order"]["id"]);

        let (status, list) = call(&app, Method::GET, "/api/v1/orders", Some(f.buyer), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().map(Vec::len), Some(1));

        let uri = format!("/api/v1/orders/{}", body["order"]["id"].as_str().unwrap());
        let (status, _) = call(&app, Method::GET, &uri, Some(uuid::Uuid::now_v7()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_cart_and_bad_input() {
        let f = fixture().await;
        let app = app(&f);
        let (status, body) = call(&app, Method::POST, "/api/v1/orders", Some(f.buyer), Some(json!({ "address_id": f.address_id, "payment_method": "cod" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");

        let (status, body) = call(&app, Method::POST, "/api/v1/orders", Some(f.buyer), Some(json!({ "address_id": f.address_id, "payment_method": "cash" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");

        let (status, body) = call(&app, Method::GET, "/api/v1/orders/not-a-uuid", Some(f.buyer), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");
    }

    #[tokio::test]
    async fn test_cancel_and_refund_routes() {
        let f = fixture().await;
        let app = app(&f);
        let detail = crate::testing::place_order(&f, crate::domain::aggregates::PaymentMethod::Cod).await;
        let sub_id = detail.sub_orders[0].sub_order.id;

        let (status, body) = call(&app, Method::POST, &format!("/api/v1/sub-orders/{sub_id}/refunds"), Some(f.buyer), Some(json!({ "amount": 1000, "reason": "dented" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let (status, body) = call(&app, Method::POST, &format!("/api/v1/sub-orders/{sub_id}/cancel"), Some(f.buyer), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sub_order"]["status"], "cancelled");
        assert_eq!(body["shipment"]["status"], "cancelled");

        let (status, _) = call(&app, Method::POST, &format!("/api/v1/sub-orders/{sub_id}/cancel"), Some(f.buyer), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_carrier_refusal_is_bad_gateway() {
        let f = fixture().await;
        let app = app(&f);
        let detail = crate::testing::place_order(&f, crate::domain::aggregates::PaymentMethod::Cod).await;
        f.carrier.set_unavailable(true);
        let sub_id = detail.sub_orders[0].sub_order.id;
        let (status, body) = call(&app, Method::POST, &format!("/api/v1/sub-orders/{sub_id}/cancel"), Some(f.buyer), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "upstream_failed");
    }
}
