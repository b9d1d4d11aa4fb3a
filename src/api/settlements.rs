//! Back-office routes: store settlements and refund decisions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;
use crate::domain::aggregates::{EligibleSubOrder, Refund, Settlement};
use crate::store::SettlementDetail;
use super::extract::{AppJson, AppPath, AppQuery};
use super::{validated, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct PeriodRequest {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MarkPaidRequest {
    #[validate(length(min = 1, max = 128))]
    pub payout_reference: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundDecision { pub approve: bool }

pub async fn list(State(s): State<AppState>, AppPath(store_id): AppPath<Uuid>) -> ApiResult<Json<Vec<Settlement>>> {
    Ok(Json(s.services.settlements.list(store_id).await?))
}

pub async fn eligible(State(s): State<AppState>, AppPath(store_id): AppPath<Uuid>, AppQuery(period): AppQuery<PeriodRequest>) -> ApiResult<Json<Vec<EligibleSubOrder>>> {
    Ok(Json(s.services.settlements.eligible(store_id, period.period_start, period.period_end).await?))
}

pub async fn create(State(s): State<AppState>, AppPath(store_id): AppPath<Uuid>, AppJson(period): AppJson<PeriodRequest>) -> ApiResult<(StatusCode, Json<SettlementDetail>)> {
    let detail = s.services.settlements.create(store_id, period.period_start, period.period_end).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn detail(State(s): State<AppState>, AppPath(id): AppPath<Uuid>) -> ApiResult<Json<SettlementDetail>> {
    Ok(Json(s.services.settlements.detail(id).await?))
}

pub async fn mark_paid(State(s): State<AppState>, AppPath(id): AppPath<Uuid>, AppJson(req): AppJson<MarkPaidRequest>) -> ApiResult<Json<Settlement>> {
    let req = validated(req)?;
    Ok(Json(s.services.settlements.mark_paid(id, &req.payout_reference).await?))
}

pub async fn cancel(State(s): State<AppState>, AppPath(id): AppPath<Uuid>) -> ApiResult<Json<Settlement>> {
    Ok(Json(s.services.settlements.cancel(id).await?))
}

pub async fn decide_refund(State(s): State<AppState>, AppPath(id): AppPath<Uuid>, AppJson(req): AppJson<RefundDecision>) -> ApiResult<Json<Refund>> {
    Ok(Json(s.services.settlements.decide_refund(id, req.approve).await?))
}
