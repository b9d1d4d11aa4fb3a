//! axum extractors whose rejections render as [`ApiError`].

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};
use crate::MarketplaceError;
use super::ApiError;

#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct AppJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct AppPath<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct AppQuery<T>(pub T);

impl From<JsonRejection> for MarketplaceError {
    fn from(rejection: JsonRejection) -> Self { MarketplaceError::Validation(rejection.body_text()) }
}

impl From<PathRejection> for MarketplaceError {
    fn from(rejection: PathRejection) -> Self { MarketplaceError::Validation(rejection.body_text()) }
}

impl From<QueryRejection> for MarketplaceError {
    fn from(rejection: QueryRejection) -> Self { MarketplaceError::Validation(rejection.body_text()) }
}
