//! GHTK status webhook: `POST /webhooks/ghtk?hash=<token>`, form-encoded or JSON.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;
use crate::carrier::GhtkWebhook;
use crate::MarketplaceError;
use super::error::ErrorBody;
use super::extract::AppQuery;
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct WebhookAuth { pub hash: Option<String> }

fn parse_body(headers: &HeaderMap, body: &[u8]) -> Result<GhtkWebhook, MarketplaceError> {
    let is_json = headers.get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let value = if is_json {
        serde_json::from_slice(body).map_err(|e| MarketplaceError::Validation(format!("invalid webhook JSON: {e}")))?
    } else {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        Value::Object(fields)
    };
    serde_json::from_value(value).map_err(|e| MarketplaceError::Validation(format!("invalid webhook payload: {e}")))
}

pub async fn ghtk(State(s): State<AppState>, AppQuery(auth): AppQuery<WebhookAuth>, headers: HeaderMap, body: Bytes) -> Response {
    let shipments = &s.services.shipments;
    if !auth.hash.as_deref().is_some_and(|h| shipments.verify_webhook_token(h)) {
        warn!("GHTK webhook rejected: bad token");
        let body = ErrorBody { error: "unauthorized", message: "invalid webhook token".into() };
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }
    let update = match parse_body(&headers, &body)
        .and_then(|hook| hook.into_update(Utc::now()).map_err(|e| MarketplaceError::Validation(e.to_string())))
    {
        Ok(update) => update,
        Err(e) => return ApiError(e).into_response(),
    };
    match shipments.apply_update(&update).await {
        Ok(Some(applied)) => Json(json!({
            "success": true,
            "outcome": applied.outcome.as_str(),
            "status": applied.shipment.status,
        })).into_response(),
        Ok(None) => Json(json!({ "success": true, "outcome": "unknown_label" })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
