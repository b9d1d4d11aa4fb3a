//! Cart routes.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;
use crate::services::CartView;
use super::extract::{AppJson, AppPath};
use super::{validated, ApiResult, AppState, BuyerId};

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub variant_id: Uuid,
    #[validate(range(min = 1, max = 999))]
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetQuantityRequest {
    /// Zero removes the line.
    #[validate(range(max = 999))]
    pub quantity: u32,
}

pub async fn view(State(s): State<AppState>, BuyerId(user): BuyerId) -> ApiResult<Json<CartView>> {
    Ok(Json(s.services.carts.view(user).await?))
}

pub async fn add_item(State(s): State<AppState>, BuyerId(user): BuyerId, AppJson(req): AppJson<AddItemRequest>) -> ApiResult<Json<CartView>> {
    let req = validated(req)?;
    Ok(Json(s.services.carts.add_item(user, req.variant_id, req.quantity).await?))
}

pub async fn set_quantity(State(s): State<AppState>, BuyerId(user): BuyerId, AppPath(variant_id): AppPath<Uuid>, AppJson(req): AppJson<SetQuantityRequest>) -> ApiResult<Json<CartView>> {
    let req = validated(req)?;
    Ok(Json(s.services.carts.set_quantity(user, variant_id, req.quantity).await?))
}

pub async fn remove_item(State(s): State<AppState>, BuyerId(user): BuyerId, AppPath(variant_id): AppPath<Uuid>) -> ApiResult<Json<CartView>> {
    Ok(Json(s.services.carts.remove_item(user, variant_id).await?))
}

pub async fn clear(State(s): State<AppState>, BuyerId(user): BuyerId) -> ApiResult<Json<CartView>> {
    Ok(Json(s.services.carts.clear(user).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use crate::api::test_support::{app, call};
    use crate::testing::fixture;

    #[tokio::test]
    async fn test_cart_routes() {
        let f = fixture().await;
        let app = app(&f);
        let user = Some(f.buyer);

        let (status, body) = call(&app, Method::POST, "/api/v1/cart/items", user, Some(json!({ "variant_id": f.shirt.id, "quantity": 2 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items_subtotal"], 300_000);

        let (status, body) = call(&app, Method::POST, "/api/v1/cart/items", user, Some(json!({ "variant_id": f.mug.id, "quantity": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");

        let uri = format!("/api/v1/cart/items/{}", f.shirt.id);
        let (status, body) = call(&app, Method::PUT, &uri, user, Some(json!({ "quantity": 1 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["item_count"], 1);

        let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/cart/items/{}", f.lamp.id), user, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::DELETE, "/api/v1/cart", user, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lines"], json!([]));
    }
}
