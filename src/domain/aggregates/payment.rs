//! Payment Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Money,
    /// Merchant reference sent to the gateway.
    pub txn_ref: String,
    pub gateway_transaction_no: Option<String>,
    pub failure_code: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { Cod, Vnpay }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { #[default] Pending, Paid, Failed, Refunded }

/// Result of a gateway callback, already verified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfirmation {
    pub txn_ref: String,
    pub amount: Money,
    pub success: bool,
    pub response_code: String,
    pub transaction_no: Option<String>,
}

/// What applying a gateway or carrier confirmation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentOutcome { Paid, AlreadyPaid, Failed }

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Cod => "cod", Self::Vnpay => "vnpay" }
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cod" => Ok(Self::Cod),
            "vnpay" => Ok(Self::Vnpay),
            other => Err(PaymentError::Corrupt(format!("unknown payment method {other}"))),
        }
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Paid => "paid", Self::Failed => "failed", Self::Refunded => "refunded" }
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(PaymentError::Corrupt(format!("unknown payment status {other}"))),
        }
    }
}

impl Payment {
    pub fn pending(order_id: Uuid, method: PaymentMethod, amount: Money, now: DateTime<Utc>) -> Self {
        let id = Uuid::now_v7();
        Self {
            id, order_id, method, status: PaymentStatus::Pending, amount,
            txn_ref: id.simple().to_string(), gateway_transaction_no: None, failure_code: None,
            paid_at: None, created_at: now, updated_at: now,
        }
    }

    pub fn mark_paid(&mut self, amount: Money, transaction_no: Option<String>, at: DateTime<Utc>) -> Result<PaymentOutcome, PaymentError> {
        if amount != self.amount { return Err(PaymentError::AmountMismatch { expected: self.amount, actual: amount }); }
        match self.status {
            PaymentStatus::Paid => Ok(PaymentOutcome::AlreadyPaid),
            PaymentStatus::Refunded => Err(PaymentError::InvalidTransition { from: self.status, to: PaymentStatus::Paid }),
            PaymentStatus::Pending | PaymentStatus::Failed => {
                self.status = PaymentStatus::Paid;
                self.gateway_transaction_no = transaction_no;
                self.failure_code = None;
                self.paid_at = Some(at);
                self.updated_at = at;
                Ok(PaymentOutcome::Paid)
            }
        }
    }

    pub fn mark_failed(&mut self, code: impl Into<String>, at: DateTime<Utc>) -> Result<PaymentOutcome, PaymentError> {
        match self.status {
            PaymentStatus::Paid => Ok(PaymentOutcome::AlreadyPaid),
            PaymentStatus::Refunded => Err(PaymentError::InvalidTransition { from: self.status, to: PaymentStatus::Failed }),
            PaymentStatus::Pending | PaymentStatus::Failed => {
                self.status = PaymentStatus::Failed;
                self.failure_code = Some(code.into());
                self.updated_at = at;
                Ok(PaymentOutcome::Failed)
            }
        }
    }

    pub fn apply_confirmation(&mut self, confirmation: &GatewayConfirmation, at: DateTime<Utc>) -> Result<PaymentOutcome, PaymentError> {
        if confirmation.success {
            self.mark_paid(confirmation.amount, confirmation.transaction_no.clone(), at)
        } else {
            self.mark_failed(confirmation.response_code.clone(), at)
        }
    }

    /// Drop a cancelled sub-order's share from a payment that has not been collected yet.
    /// Returns `false` when the money was already taken and must be refunded instead.
    pub fn release_share(&mut self, share: Money, at: DateTime<Utc>) -> bool {
        match self.status {
            PaymentStatus::Pending | PaymentStatus::Failed => {
                self.amount = self.amount.saturating_sub(share);
                self.updated_at = at;
                true
            }
            PaymentStatus::Paid => false,
            PaymentStatus::Refunded => true,
        }
    }

    pub fn is_paid(&self) -> bool { self.status == PaymentStatus::Paid }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("payment not found")]
    NotFound,
    #[error("paid amount {actual} does not match expected {expected}")]
    AmountMismatch { expected: Money, actual: Money },
    #[error("payment cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: PaymentStatus, to: PaymentStatus },
    #[error("invalid gateway signature")]
    InvalidSignature,
    #[error("payment gateway is not configured")]
    GatewayUnavailable,
    #[error("malformed gateway callback: {0}")]
    MalformedCallback(String),
    #[error("corrupt payment record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_paid_is_idempotent() {
        let now = Utc::now();
        let mut p = Payment::pending(Uuid::now_v7(), PaymentMethod::Vnpay, Money::vnd(250_000), now);
        assert_eq!(p.mark_paid(Money::vnd(250_000), Some("14123456".into()), now), Ok(PaymentOutcome::Paid));
        assert_eq!(p.mark_paid(Money::vnd(250_000), Some("14123456".into()), now), Ok(PaymentOutcome::AlreadyPaid));
        assert_eq!(p.mark_failed("24", now), Ok(PaymentOutcome::AlreadyPaid));
        assert!(p.is_paid());
    }

    #[test]
    fn test_amount_mismatch_rejected() {
        let now = Utc::now();
        let mut p = Payment::pending(Uuid::now_v7(), PaymentMethod::Vnpay, Money::vnd(250_000), now);
        assert!(matches!(p.mark_paid(Money::vnd(1), None, now), Err(PaymentError::AmountMismatch { .. })));
        assert_eq!(p.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_release_share_only_before_collection() {
        let now = Utc::now();
        let mut p = Payment::pending(Uuid::now_v7(), PaymentMethod::Cod, Money::vnd(300_000), now);
        assert!(p.release_share(Money::vnd(100_000), now));
        assert_eq!(p.amount, Money::vnd(200_000));
        p.mark_paid(Money::vnd(200_000), None, now).unwrap();
        assert!(!p.release_share(Money::vnd(50_000), now));
        assert_eq!(p.amount, Money::vnd(200_000));
    }

    #[test]
    fn test_failed_payment_can_be_retried() {
        let now = Utc::now();
        let mut p = Payment::pending(Uuid::now_v7(), PaymentMethod::Vnpay, Money::vnd(90_000), now);
        p.mark_failed("24", now).unwrap();
        assert_eq!(p.failure_code.as_deref(), Some("24"));
        p.mark_paid(Money::vnd(90_000), None, now).unwrap();
        assert_eq!(p.failure_code, None);
        assert_eq!(p.status, PaymentStatus::Paid);
    }
}
