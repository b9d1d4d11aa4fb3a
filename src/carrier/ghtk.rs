//! Giao Hàng Tiết Kiệm (GHTK) REST client.
//!
//! All calls authenticate with the `Token` header. GHTK is loose with types: numeric
//! fields arrive as numbers or strings depending on endpoint, so those go through
//! [`lenient_int`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use crate::domain::aggregates::{CarrierOrder, CarrierUpdate, ShipmentStatus};
use crate::domain::value_objects::Money;
use super::{Carrier, CarrierError, FeeRequest, ParcelRequest};

pub const PRODUCTION_URL: &str = "https://services.giaohangtietkiem.vn";
pub const STAGING_URL: &str = "https://services-staging.ghtklab.com";

/// Map a GHTK `status_id` to our shipment status; `None` for codes we do not track.
pub fn map_status(code: i32) -> Option<ShipmentStatus> {
    use ShipmentStatus::*;
    let status = match code {
        -1 => Cancelled,
        1 => Created,
        2 => Accepted,
        12 | 8 | 128 => PickingUp,
        3 | 123 => PickedUp,
        4 | 10 | 410 => Delivering,
        5 | 45 => Delivered,
        6 => Completed,
        7 | 127 => PickupFailed,
        9 | 49 => DeliveryFailed,
        20 => Returning,
        11 | 21 => Returned,
        13 => Lost,
        _ => return None,
    };
    Some(status)
}

/// GHTK sends RFC 3339 in webhooks and `YYYY-MM-DD HH:MM:SS` (Vietnam time) in lookups.
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) { return Some(at.with_timezone(&Utc)); }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    // Vietnam has no DST: always UTC+7.
    Some(Utc.from_utc_datetime(&(naive - chrono::Duration::hours(7))))
}

fn lenient_int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)).ok_or_else(|| de::Error::custom("number out of range")),
        Value::String(s) => s.trim().parse().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected an integer, got {other}"))),
    }
}

fn lenient_opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64()),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("expected an integer, got {other}"))),
    }
}

fn to_status_code(raw: i64) -> Result<i32, CarrierError> {
    i32::try_from(raw).map_err(|_| CarrierError::Malformed(format!("status code {raw} out of range")))
}

/// Status callback posted by GHTK, as form fields or JSON.
#[derive(Clone, Debug, Deserialize)]
pub struct GhtkWebhook {
    pub label_id: String,
    #[serde(default)]
    pub partner_id: Option<String>,
    #[serde(deserialize_with = "lenient_int")]
    pub status_id: i64,
    #[serde(default)]
    pub action_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_int")]
    pub reason_code: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GhtkWebhook {
    pub fn into_update(self, received_at: DateTime<Utc>) -> Result<CarrierUpdate, CarrierError> {
        let status_code = to_status_code(self.status_id)?;
        let action_time = self.action_time.as_deref().and_then(parse_time).unwrap_or(received_at);
        let reason = match (self.reason_code, self.reason) {
            (Some(code), Some(text)) => Some(format!("{code}: {text}")),
            (None, Some(text)) => Some(text),
            (Some(code), None) => Some(code.to_string()),
            (None, None) => None,
        };
        Ok(CarrierUpdate { label: self.label_id, status_code, status: map_status(status_code), action_time, reason })
    }
}

#[derive(Deserialize)]
struct FeeResponse { success: bool, message: Option<String>, fee: Option<FeeBody> }

#[derive(Deserialize)]
struct FeeBody {
    #[serde(deserialize_with = "lenient_int")]
    fee: i64,
    #[serde(default, deserialize_with = "lenient_opt_int")]
    insurance_fee: Option<i64>,
    #[serde(default)]
    delivery: Option<bool>,
}

#[derive(Deserialize)]
struct CreateResponse { success: bool, message: Option<String>, order: Option<CreatedOrder> }

#[derive(Deserialize)]
struct CreatedOrder {
    label: String,
    #[serde(deserialize_with = "lenient_int")]
    fee: i64,
    #[serde(default, deserialize_with = "lenient_opt_int")]
    insurance_fee: Option<i64>,
    #[serde(default)]
    estimated_deliver_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_int")]
    status_id: Option<i64>,
}

#[derive(Deserialize)]
struct StatusResponse { success: bool, message: Option<String>, order: Option<TrackedOrder> }

#[derive(Deserialize)]
struct TrackedOrder {
    label_id: String,
    #[serde(deserialize_with = "lenient_int")]
    status: i64,
    #[serde(default)]
    status_text: Option<String>,
    #[serde(default)]
    modified: Option<String>,
}

#[derive(Deserialize)]
struct PlainResponse { success: bool, message: Option<String> }

#[derive(Serialize)]
struct OrderPayload<'a> { products: Vec<ProductPayload<'a>>, order: ParcelPayload<'a> }

#[derive(Serialize)]
struct ProductPayload<'a> { name: &'a str, weight: f64, quantity: u32 }

#[derive(Serialize)]
struct ParcelPayload<'a> {
    id: &'a str,
    pick_name: &'a str,
    pick_tel: &'a str,
    pick_address: &'a str,
    pick_ward: &'a str,
    pick_district: &'a str,
    pick_province: &'a str,
    name: &'a str,
    tel: &'a str,
    address: &'a str,
    ward: &'a str,
    district: &'a str,
    province: &'a str,
    hamlet: &'a str,
    is_freeship: &'a str,
    pick_money: i64,
    value: i64,
    transport: &'a str,
}

fn rejected(message: Option<String>) -> CarrierError {
    CarrierError::Rejected(message.unwrap_or_else(|| "no message".into()))
}

pub struct GhtkCarrier {
    client: Client,
    base_url: String,
    token: String,
}

impl GhtkCarrier {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, CarrierError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), token: token.into() })
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.base_url, path) }
}

#[async_trait]
impl Carrier for GhtkCarrier {
    fn name(&self) -> &'static str { "ghtk" }

    async fn quote_fee(&self, request: &FeeRequest) -> Result<Money, CarrierError> {
        let weight = request.weight_grams.to_string();
        let value = request.declared_value.amount().to_string();
        let resp: FeeResponse = self.client
            .get(self.url("/services/shipment/fee"))
            .header("Token", &self.token)
            .query(&[
                ("pick_province", request.pickup.province.as_str()),
                ("pick_district", request.pickup.district.as_str()),
                ("province", request.delivery.province.as_str()),
                ("district", request.delivery.district.as_str()),
                ("ward", request.delivery.ward.as_str()),
                ("address", request.delivery.street.as_str()),
                ("weight", weight.as_str()),
                ("value", value.as_str()),
                ("transport", "road"),
                ("deliver_option", "none"),
            ])
            .send()
            .await?
            .json()
            .await?;
        if !resp.success { return Err(rejected(resp.message)); }
        let fee = resp.fee.ok_or_else(|| CarrierError::Malformed("fee response without fee".into()))?;
        if fee.delivery == Some(false) {
            return Err(CarrierError::Rejected(format!("no delivery to {}, {}", request.delivery.district, request.delivery.province)));
        }
        Ok(Money::vnd(fee.fee + fee.insurance_fee.unwrap_or(0)))
    }

    async fn create_order(&self, request: &ParcelRequest) -> Result<CarrierOrder, CarrierError> {
        let (pickup, delivery) = (&request.pickup, &request.delivery);
        let payload = OrderPayload {
            products: vec![ProductPayload {
                name: "Marketplace parcel",
                weight: f64::from(request.weight_grams.max(1)) / 1000.0,
                quantity: 1,
            }],
            order: ParcelPayload {
                id: &request.partner_id,
                pick_name: &pickup.name, pick_tel: &pickup.phone, pick_address: &pickup.street, pick_ward: &pickup.ward,
                pick_district: &pickup.district, pick_province: &pickup.province,
                name: &delivery.name, tel: &delivery.phone, address: &delivery.street, ward: &delivery.ward,
                district: &delivery.district, province: &delivery.province, hamlet: "Khác",
                is_freeship: "1", pick_money: request.cod_amount.amount(), value: request.declared_value.amount(),
                transport: "road",
            },
        };
        let resp: CreateResponse = self.client
            .post(self.url("/services/shipment/order"))
            .header("Token", &self.token)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if !resp.success { return Err(rejected(resp.message)); }
        let order = resp.order.ok_or_else(|| CarrierError::Malformed("order response without order".into()))?;
        debug!(label = %order.label, partner_id = %request.partner_id, "GHTK order created");
        Ok(CarrierOrder {
            label: order.label,
            fee: Money::vnd(order.fee + order.insurance_fee.unwrap_or(0)),
            estimated_delivery: order.estimated_deliver_time,
            status_code: order.status_id.map(to_status_code).transpose()?,
        })
    }

    async fn fetch_status(&self, label: &str) -> Result<CarrierUpdate, CarrierError> {
        let resp: StatusResponse = self.client
            .get(self.url(&format!("/services/shipment/v2/{label}")))
            .header("Token", &self.token)
            .send()
            .await?
            .json()
            .await?;
        if !resp.success { return Err(rejected(resp.message)); }
        let order = resp.order.ok_or_else(|| CarrierError::Malformed("status response without order".into()))?;
        let status_code = to_status_code(order.status)?;
        let action_time = order.modified.as_deref().and_then(parse_time).ok_or_else(|| {
            warn!(label, "GHTK status without a usable modified time");
            CarrierError::Malformed(format!("no modified time for {label}"))
        })?;
        Ok(CarrierUpdate {
            label: order.label_id, status_code, status: map_status(status_code), action_time, reason: order.status_text,
        })
    }

    async fn cancel_order(&self, label: &str) -> Result<(), CarrierError> {
        let resp: PlainResponse = self.client
            .post(self.url(&format!("/services/shipment/cancel/{label}")))
            .header("Token", &self.token)
            .send()
            .await?
            .json()
            .await?;
        if !resp.success { return Err(rejected(resp.message)); }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(-1), Some(ShipmentStatus::Cancelled));
        assert_eq!(map_status(128), Some(ShipmentStatus::PickingUp));
        assert_eq!(map_status(45), Some(ShipmentStatus::Delivered));
        assert_eq!(map_status(6), Some(ShipmentStatus::Completed));
        assert_eq!(map_status(49), Some(ShipmentStatus::DeliveryFailed));
        assert_eq!(map_status(21), Some(ShipmentStatus::Returned));
        assert_eq!(map_status(13), Some(ShipmentStatus::Lost));
        assert_eq!(map_status(999), None);
    }

    #[test]
    fn test_parse_time_formats() {
        let rfc = parse_time("2026-10-18T09:30:00+07:00").unwrap();
        let local = parse_time("2026-10-18 09:30:00").unwrap();
        assert_eq!(rfc, local);
        assert_eq!(rfc.to_rfc3339(), "2026-10-18T02:30:00+00:00");
        assert!(parse_time("yesterday").is_none());
    }

    #[test]
    fn test_webhook_accepts_string_and_numeric_codes() {
        let json: GhtkWebhook = serde_json::from_value(serde_json::json!({
            "label_id": "S1.A1.2001", "partner_id": "abc", "status_id": 5,
            "action_time": "2026-10-18T09:30:00+07:00", "reason_code": "", "reason": ""
        })).unwrap();
        let update = json.into_update(Utc::now()).unwrap();
        assert_eq!(update.status, Some(ShipmentStatus::Delivered));
        assert_eq!(update.reason.as_deref(), Some(""));

        let form: GhtkWebhook = serde_json::from_value(serde_json::json!({
            "label_id": "S1.A1.2001", "status_id": "410", "reason_code": "140", "reason": "Khách hẹn giao lại"
        })).unwrap();
        let received = Utc::now();
        let update = form.into_update(received).unwrap();
        assert_eq!(update.status_code, 410);
        assert_eq!(update.status, Some(ShipmentStatus::Delivering));
        assert_eq!(update.action_time, received);
        assert_eq!(update.reason.as_deref(), Some("140: Khách hẹn giao lại"));
    }

    #[test]
    fn test_created_order_with_string_fee() {
        let resp: CreateResponse = serde_json::from_value(serde_json::json!({
            "success": true, "message": "",
            "order": { "partner_id": "x", "label": "S1.A1.17373471", "area": "1", "fee": "30400", "insurance_fee": "0", "status_id": 1 }
        })).unwrap();
        let order = resp.order.unwrap();
        assert_eq!(order.fee, 30_400);
        assert_eq!(order.status_id, Some(1));
    }
}
