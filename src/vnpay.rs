//! VNPAY 2.1.0 payment gateway: signed redirect URLs and callback verification.
//!
//! Both directions sign the same canonical string: parameters sorted by key and
//! form-urlencoded, HMAC-SHA512 with the merchant hash secret, lowercase hex.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha512;
use std::collections::{BTreeMap, HashMap};
use url::form_urlencoded;
use crate::domain::aggregates::{GatewayConfirmation, Payment, PaymentError};
use crate::domain::value_objects::Money;

pub const VERSION: &str = "2.1.0";
pub const SANDBOX_PAY_URL: &str = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html";
const PAYMENT_WINDOW_MINUTES: i64 = 15;
const SUCCESS_CODE: &str = "00";

#[derive(Clone, Debug)]
pub struct VnpayGateway {
    tmn_code: String,
    hash_secret: String,
    pay_url: String,
    return_url: String,
}

/// Body VNPAY expects back from the IPN endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IpnResponse {
    #[serde(rename = "RspCode")]
    pub rsp_code: &'static str,
    #[serde(rename = "Message")]
    pub message: &'static str,
}

impl IpnResponse {
    pub const CONFIRMED: IpnResponse = IpnResponse { rsp_code: "00", message: "Confirm Success" };
    pub const ORDER_NOT_FOUND: IpnResponse = IpnResponse { rsp_code: "01", message: "Order not found" };
    pub const ALREADY_CONFIRMED: IpnResponse = IpnResponse { rsp_code: "02", message: "Order already confirmed" };
    pub const INVALID_AMOUNT: IpnResponse = IpnResponse { rsp_code: "04", message: "Invalid amount" };
    pub const INVALID_SIGNATURE: IpnResponse = IpnResponse { rsp_code: "97", message: "Invalid signature" };
    pub const UNKNOWN_ERROR: IpnResponse = IpnResponse { rsp_code: "99", message: "Unknown error" };
}

fn gmt7(at: DateTime<Utc>) -> String {
    // Vietnam has no DST.
    (at + Duration::hours(7)).format("%Y%m%d%H%M%S").to_string()
}

fn canonical<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let sorted: BTreeMap<&str, &str> = params
        .into_iter()
        .filter(|(k, v)| k.starts_with("vnp_") && *k != "vnp_SecureHash" && *k != "vnp_SecureHashType" && !v.is_empty())
        .collect();
    form_urlencoded::Serializer::new(String::new()).extend_pairs(sorted).finish()
}

impl VnpayGateway {
    pub fn new(tmn_code: impl Into<String>, hash_secret: impl Into<String>, pay_url: impl Into<String>, return_url: impl Into<String>) -> Self {
        Self { tmn_code: tmn_code.into(), hash_secret: hash_secret.into(), pay_url: pay_url.into(), return_url: return_url.into() }
    }

    fn mac(&self) -> Result<Hmac<Sha512>, PaymentError> {
        Hmac::<Sha512>::new_from_slice(self.hash_secret.as_bytes()).map_err(|_| PaymentError::GatewayUnavailable)
    }

    fn sign(&self, data: &str) -> Result<String, PaymentError> {
        let mut mac = self.mac()?;
        mac.update(data.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Redirect URL for the customer's browser.
    pub fn payment_url(&self, payment: &Payment, order_code: &str, client_ip: &str, now: DateTime<Utc>) -> Result<String, PaymentError> {
        let amount = (payment.amount.amount() * 100).to_string();
        let created = gmt7(now);
        let expires = gmt7(now + Duration::minutes(PAYMENT_WINDOW_MINUTES));
        let info = format!("Thanh toan don hang {order_code}");
        let params = [
            ("vnp_Version", VERSION),
            ("vnp_Command", "pay"),
            ("vnp_TmnCode", self.tmn_code.as_str()),
            ("vnp_Amount", amount.as_str()),
            ("vnp_CurrCode", "VND"),
            ("vnp_TxnRef", payment.txn_ref.as_str()),
            ("vnp_OrderInfo", info.as_str()),
            ("vnp_OrderType", "other"),
            ("vnp_Locale", "vn"),
            ("vnp_ReturnUrl", self.return_url.as_str()),
            ("vnp_IpAddr", client_ip),
            ("vnp_CreateDate", created.as_str()),
            ("vnp_ExpireDate", expires.as_str()),
        ];
        let query = canonical(params);
        let hash = self.sign(&query)?;
        Ok(format!("{}?{}&vnp_SecureHash={}", self.pay_url, query, hash))
    }

    /// Check a callback's signature and read the payment result out of it.
    pub fn verify(&self, params: &HashMap<String, String>) -> Result<GatewayConfirmation, PaymentError> {
        let given = params.get("vnp_SecureHash").ok_or(PaymentError::InvalidSignature)?;
        let given = hex::decode(given.trim()).map_err(|_| PaymentError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(canonical(params.iter().map(|(k, v)| (k.as_str(), v.as_str()))).as_bytes());
        mac.verify_slice(&given).map_err(|_| PaymentError::InvalidSignature)?;

        let field = |name: &str| params.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());
        let txn_ref = field("vnp_TxnRef").ok_or_else(|| PaymentError::MalformedCallback("missing vnp_TxnRef".into()))?;
        let raw_amount: i64 = field("vnp_Amount")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| PaymentError::MalformedCallback("missing or invalid vnp_Amount".into()))?;
        if raw_amount < 0 || raw_amount % 100 != 0 {
            return Err(PaymentError::MalformedCallback(format!("vnp_Amount {raw_amount} is not whole đồng")));
        }
        let response_code = field("vnp_ResponseCode").ok_or_else(|| PaymentError::MalformedCallback("missing vnp_ResponseCode".into()))?;
        let transaction_ok = field("vnp_TransactionStatus").map_or(true, |status| status == SUCCESS_CODE);
        Ok(GatewayConfirmation {
            txn_ref: txn_ref.to_string(),
            amount: Money::vnd(raw_amount / 100),
            success: response_code == SUCCESS_CODE && transaction_ok,
            response_code: response_code.to_string(),
            transaction_no: field("vnp_TransactionNo").map(str::to_string),
        })
    }

    /// Callback parameters signed the way VNPAY signs them.
    #[cfg(test)]
    pub(crate) fn signed_callback(&self, fields: &[(&str, &str)]) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let hash = self.sign(&canonical(fields.iter().copied())).unwrap();
        params.insert("vnp_SecureHashType".into(), "HmacSHA512".into());
        params.insert("vnp_SecureHash".into(), hash);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::PaymentMethod;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn gateway() -> VnpayGateway {
        VnpayGateway::new("DEMOTMN1", "SECRETKEY0123456789", SANDBOX_PAY_URL, "https://shop.example/payments/vnpay/return")
    }

    #[test]
    fn test_payment_url_is_signed_and_scaled() {
        let gateway = gateway();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap();
        let payment = Payment::pending(Uuid::now_v7(), PaymentMethod::Vnpay, Money::vnd(250_000), now);
        let url = gateway.payment_url(&payment, "ORD-1", "127.0.0.1", now).unwrap();

        let parsed = url::Url::parse(&url).unwrap();
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["vnp_Amount"], "25000000");
        assert_eq!(params["vnp_CreateDate"], "20261018090000");
        assert_eq!(params["vnp_ExpireDate"], "20261018091500");
        assert_eq!(params["vnp_TxnRef"], payment.txn_ref);
        assert_eq!(params["vnp_OrderInfo"], "Thanh toan don hang ORD-1");

        let query = parsed.query().unwrap();
        let (unsigned, hash) = query.split_once("&vnp_SecureHash=").unwrap();
        assert_eq!(gateway.sign(unsigned).unwrap(), hash);
        assert_eq!(hash.len(), 128);
    }

    #[test]
    fn test_verify_reads_successful_callback() {
        let gateway = gateway();
        let params = gateway.signed_callback(&[
            ("vnp_TmnCode", "DEMOTMN1"), ("vnp_TxnRef", "abc123"), ("vnp_Amount", "25000000"),
            ("vnp_ResponseCode", "00"), ("vnp_TransactionStatus", "00"), ("vnp_TransactionNo", "14123456"),
            ("vnp_OrderInfo", "Thanh toan don hang ORD-1"),
        ]);
        let confirmation = gateway.verify(&params).unwrap();
        assert!(confirmation.success);
        assert_eq!(confirmation.amount, Money::vnd(250_000));
        assert_eq!(confirmation.txn_ref, "abc123");
        assert_eq!(confirmation.transaction_no.as_deref(), Some("14123456"));
    }

    #[test]
    fn test_verify_reports_declined_payment() {
        let gateway = gateway();
        let params = gateway.signed_callback(&[
            ("vnp_TxnRef", "abc123"), ("vnp_Amount", "25000000"), ("vnp_ResponseCode", "24"),
        ]);
        let confirmation = gateway.verify(&params).unwrap();
        assert!(!confirmation.success);
        assert_eq!(confirmation.response_code, "24");
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let gateway = gateway();
        let mut params = gateway.signed_callback(&[
            ("vnp_TxnRef", "abc123"), ("vnp_Amount", "25000000"), ("vnp_ResponseCode", "00"),
        ]);
        params.insert("vnp_Amount".into(), "100".into());
        assert_eq!(gateway.verify(&params), Err(PaymentError::InvalidSignature));

        params.remove("vnp_SecureHash");
        assert_eq!(gateway.verify(&params), Err(PaymentError::InvalidSignature));

        let other = VnpayGateway::new("DEMOTMN1", "another-secret", SANDBOX_PAY_URL, "https://shop.example/r");
        let params = other.signed_callback(&[("vnp_TxnRef", "abc123"), ("vnp_Amount", "100"), ("vnp_ResponseCode", "00")]);
        assert_eq!(gateway.verify(&params), Err(PaymentError::InvalidSignature));
    }

    #[test]
    fn test_ipn_response_shape() {
        let json = serde_json::to_value(IpnResponse::INVALID_AMOUNT).unwrap();
        assert_eq!(json, serde_json::json!({ "RspCode": "04", "Message": "Invalid amount" }));
    }
}
