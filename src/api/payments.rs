//! VNPAY callbacks. The IPN always answers 200 with a gateway response code.

use axum::extract::State;
use axum::Json;
use std::collections::HashMap;
use crate::services::PaymentReturn;
use crate::vnpay::IpnResponse;
use super::extract::AppQuery;
use super::{ApiResult, AppState};

pub async fn ipn(State(s): State<AppState>, AppQuery(params): AppQuery<HashMap<String, String>>) -> Json<IpnResponse> {
    Json(s.services.payments.handle_ipn(&params).await)
}

pub async fn vnpay_return(State(s): State<AppState>, AppQuery(params): AppQuery<HashMap<String, String>>) -> ApiResult<Json<PaymentReturn>> {
    Ok(Json(s.services.payments.verify_return(&params).await?))
}
