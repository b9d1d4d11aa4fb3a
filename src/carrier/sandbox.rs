//! Offline carrier for development and tests: flat fee, synthetic labels, statuses set by hand.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use crate::domain::aggregates::{CarrierOrder, CarrierUpdate};
use crate::domain::value_objects::Money;
use super::{map_status, Carrier, CarrierError, FeeRequest, ParcelRequest};

const BASE_FEE: i64 = 22_000;
const PER_EXTRA_KG: i64 = 5_000;
const OTHER_PROVINCE_SURCHARGE: i64 = 8_000;

#[derive(Default)]
pub struct SandboxCarrier {
    next_label: AtomicU64,
    unavailable: AtomicBool,
    rejecting_bookings: AtomicBool,
    statuses: Mutex<HashMap<String, i32>>,
}

impl SandboxCarrier {
    pub fn new() -> Self { Self::default() }

    /// Make every call fail with [`CarrierError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) { self.unavailable.store(unavailable, Ordering::SeqCst); }

    /// Refuse new parcels while quotes and tracking keep working.
    pub fn reject_bookings(&self, reject: bool) { self.rejecting_bookings.store(reject, Ordering::SeqCst); }

    /// Set the carrier status code that the next `fetch_status` for `label` reports.
    pub fn set_status(&self, label: &str, code: i32) {
        if let Ok(mut statuses) = self.statuses.lock() { statuses.insert(label.to_string(), code); }
    }

    pub fn status_of(&self, label: &str) -> Option<i32> {
        self.statuses.lock().ok().and_then(|statuses| statuses.get(label).copied())
    }

    fn ensure_available(&self) -> Result<(), CarrierError> {
        if self.unavailable.load(Ordering::SeqCst) { Err(CarrierError::Unavailable) } else { Ok(()) }
    }

    fn fee_for(&self, pickup_province: &str, delivery_province: &str, weight_grams: u32) -> Money {
        let extra_kg = i64::from(weight_grams.saturating_sub(1).saturating_div(1000));
        let surcharge = if pickup_province.eq_ignore_ascii_case(delivery_province) { 0 } else { OTHER_PROVINCE_SURCHARGE };
        Money::vnd(BASE_FEE + extra_kg * PER_EXTRA_KG + surcharge)
    }
}

#[async_trait]
impl Carrier for SandboxCarrier {
    fn name(&self) -> &'static str { "sandbox" }

    async fn quote_fee(&self, request: &FeeRequest) -> Result<Money, CarrierError> {
        self.ensure_available()?;
        Ok(self.fee_for(&request.pickup.province, &request.delivery.province, request.weight_grams))
    }

    async fn create_order(&self, request: &ParcelRequest) -> Result<CarrierOrder, CarrierError> {
        self.ensure_available()?;
        if self.rejecting_bookings.load(Ordering::SeqCst) {
            return Err(CarrierError::Rejected("pickup area temporarily closed".into()));
        }
        let seq = self.next_label.fetch_add(1, Ordering::SeqCst) + 1;
        let label = format!("SBX.{seq:08}");
        self.set_status(&label, 1);
        Ok(CarrierOrder {
            label,
            fee: self.fee_for(&request.pickup.province, &request.delivery.province, request.weight_grams),
            estimated_delivery: None,
            status_code: Some(1),
        })
    }

    async fn fetch_status(&self, label: &str) -> Result<CarrierUpdate, CarrierError> {
        self.ensure_available()?;
        let code = self.status_of(label).ok_or_else(|| CarrierError::Rejected(format!("unknown label {label}")))?;
        Ok(CarrierUpdate { label: label.to_string(), status_code: code, status: map_status(code), action_time: Utc::now(), reason: None })
    }

    async fn cancel_order(&self, label: &str) -> Result<(), CarrierError> {
        self.ensure_available()?;
        match self.status_of(label) {
            None => Err(CarrierError::Rejected(format!("unknown label {label}"))),
            Some(code) if !matches!(code, 1 | 2 | 12 | 8 | 128 | 7 | 127) => {
                Err(CarrierError::Rejected(format!("parcel {label} already picked up")))
            }
            Some(_) => {
                self.set_status(label, -1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Address, ShipmentStatus};

    fn address(province: &str) -> Address {
        Address {
            name: "Nguyễn Văn A".into(), phone: "0900000000".into(), street: "1 Lê Lợi".into(),
            ward: "Bến Nghé".into(), district: "Quận 1".into(), province: province.into(),
        }
    }

    fn parcel() -> ParcelRequest {
        ParcelRequest {
            partner_id: "p-1".into(), pickup: address("TP. Hồ Chí Minh"), delivery: address("Hà Nội"),
            weight_grams: 2500, cod_amount: Money::vnd(100_000), declared_value: Money::vnd(100_000),
        }
    }

    #[tokio::test]
    async fn test_fee_grows_with_weight_and_distance() {
        let carrier = SandboxCarrier::new();
        let near = FeeRequest { pickup: address("Hà Nội"), delivery: address("Hà Nội"), weight_grams: 900, declared_value: Money::ZERO };
        assert_eq!(carrier.quote_fee(&near).await.unwrap(), Money::vnd(22_000));
        let far = FeeRequest { delivery: address("Đà Nẵng"), weight_grams: 2500, ..near };
        assert_eq!(carrier.quote_fee(&far).await.unwrap(), Money::vnd(22_000 + 2 * 5_000 + 8_000));
    }

    #[tokio::test]
    async fn test_status_follows_manual_updates() {
        let carrier = SandboxCarrier::new();
        let order = carrier.create_order(&parcel()).await.unwrap();
        assert_eq!(carrier.fetch_status(&order.label).await.unwrap().status, Some(ShipmentStatus::Created));
        carrier.set_status(&order.label, 5);
        assert_eq!(carrier.fetch_status(&order.label).await.unwrap().status, Some(ShipmentStatus::Delivered));
    }

    #[tokio::test]
    async fn test_cancel_refused_after_pickup() {
        let carrier = SandboxCarrier::new();
        let first = carrier.create_order(&parcel()).await.unwrap();
        let second = carrier.create_order(&parcel()).await.unwrap();
        assert_ne!(first.label, second.label);

        carrier.cancel_order(&first.label).await.unwrap();
        assert_eq!(carrier.status_of(&first.label), Some(-1));

        carrier.set_status(&second.label, 3);
        assert!(matches!(carrier.cancel_order(&second.label).await, Err(CarrierError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let carrier = SandboxCarrier::new();
        carrier.set_unavailable(true);
        assert!(matches!(carrier.create_order(&parcel()).await, Err(CarrierError::Unavailable)));
        carrier.set_unavailable(false);
        assert!(carrier.create_order(&parcel()).await.is_ok());
    }
}
