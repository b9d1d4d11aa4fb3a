//! Voucher administration and buyer reservations.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;
use crate::domain::aggregates::{Voucher, VoucherReservation};
use crate::domain::value_objects::Money;
use crate::services::NewVoucher;
use super::extract::{AppJson, AppPath};
use super::{validated, ApiResult, AppState, BuyerId};

#[derive(Debug, Deserialize, Validate)]
pub struct ReserveRequest {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
    /// Required for shipping vouchers; order vouchers default to the cart subtotal.
    #[validate(range(min = 0))]
    pub eligible_amount: Option<i64>,
}

pub async fn create(State(s): State<AppState>, AppJson(req): AppJson<NewVoucher>) -> ApiResult<(StatusCode, Json<Voucher>)> {
    Ok((StatusCode::CREATED, Json(s.services.vouchers.create(req).await?)))
}

pub async fn reserve(State(s): State<AppState>, BuyerId(user): BuyerId, AppJson(req): AppJson<ReserveRequest>) -> ApiResult<(StatusCode, Json<VoucherReservation>)> {
    let req = validated(req)?;
    let reservation = s.services.vouchers.reserve(user, &req.code, req.eligible_amount.map(Money::vnd)).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn release(State(s): State<AppState>, BuyerId(user): BuyerId, AppPath(id): AppPath<Uuid>) -> ApiResult<Json<VoucherReservation>> {
    Ok(Json(s.services.vouchers.release(user, id).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use crate::api::test_support::{app, call};
    use crate::testing::fixture;

    #[tokio::test]
    async fn test_create_reserve_release() {
        let f = fixture().await;
        let app = app(&f);
        let now = Utc::now();
        let voucher = json!({
            "code": "freeship30", "scope": "shipping", "discount": { "type": "fixed", "value": 30000 },
            "usage_limit": 1, "starts_at": now - Duration::hours(1), "ends_at": now + Duration::days(7)
        });
        let (status, body) = call(&app, Method::POST, "/api/v1/vouchers", None, Some(voucher.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["code"], "FREESHIP30");
        let (status, _) = call(&app, Method::POST, "/api/v1/vouchers", None, Some(voucher)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let hold = json!({ "code": "FREESHIP30", "eligible_amount": 40000 });
        let (status, body) = call(&app, Method::POST, "/api/v1/vouchers/reservations", Some(f.buyer), Some(hold.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "active");
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::POST, "/api/v1/vouchers/reservations", Some(uuid::Uuid::now_v7()), Some(hold)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let uri = format!("/api/v1/vouchers/reservations/{id}");
        let (status, _) = call(&app, Method::DELETE, &uri, Some(uuid::Uuid::now_v7()), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = call(&app, Method::DELETE, &uri, Some(f.buyer), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "released");
    }
}
