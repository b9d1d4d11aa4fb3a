//! Shipping carrier port.

pub mod ghtk;
mod sandbox;

pub use ghtk::{map_status, GhtkCarrier, GhtkWebhook};
pub use sandbox::SandboxCarrier;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use crate::domain::aggregates::{Address, CarrierOrder, CarrierUpdate, Shipment};
use crate::domain::value_objects::Money;
use crate::MarketplaceError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeeRequest {
    pub pickup: Address,
    pub delivery: Address,
    pub weight_grams: u32,
    pub declared_value: Money,
}

/// Everything the carrier needs to open a parcel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParcelRequest {
    /// Our reference, echoed back by the carrier as `partner_id`.
    pub partner_id: String,
    pub pickup: Address,
    pub delivery: Address,
    pub weight_grams: u32,
    pub cod_amount: Money,
    pub declared_value: Money,
}

impl ParcelRequest {
    pub fn for_shipment(shipment: &Shipment) -> Self {
        Self {
            partner_id: shipment.id.to_string(),
            pickup: shipment.pickup_address.clone(),
            delivery: shipment.delivery_address.clone(),
            weight_grams: shipment.weight_grams,
            cod_amount: shipment.cod_amount,
            declared_value: shipment.declared_value,
        }
    }
}

#[async_trait]
pub trait Carrier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn quote_fee(&self, request: &FeeRequest) -> Result<Money, CarrierError>;
    async fn create_order(&self, request: &ParcelRequest) -> Result<CarrierOrder, CarrierError>;
    async fn fetch_status(&self, label: &str) -> Result<CarrierUpdate, CarrierError>;
    async fn cancel_order(&self, label: &str) -> Result<(), CarrierError>;
}

pub type DynCarrier = Arc<dyn Carrier>;

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("carrier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("carrier rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected carrier response: {0}")]
    Malformed(String),
    #[error("carrier is unavailable")]
    Unavailable,
}

impl From<CarrierError> for MarketplaceError {
    fn from(e: CarrierError) -> Self { MarketplaceError::Carrier(e.to_string()) }
}
