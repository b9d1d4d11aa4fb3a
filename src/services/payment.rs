//! VNPAY callbacks: the IPN that moves the payment and the browser return that only reports.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use crate::domain::aggregates::{PaymentError, PaymentMethod, PaymentOutcome, PaymentStatus};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::Money;
use crate::messaging::DynPublisher;
use crate::store::DynStore;
use crate::vnpay::{IpnResponse, VnpayGateway};
use crate::Result;

/// What the buyer's browser is told after the gateway redirect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaymentReturn {
    pub txn_ref: String,
    pub amount: Money,
    pub success: bool,
    pub response_code: String,
    pub transaction_no: Option<String>,
    /// Our view of the payment; may still be pending if the IPN has not arrived.
    pub payment_status: Option<PaymentStatus>,
}

#[derive(Clone)]
pub struct PaymentService {
    store: DynStore,
    gateway: Arc<VnpayGateway>,
    publisher: DynPublisher,
}

impl PaymentService {
    pub fn new(store: DynStore, gateway: Arc<VnpayGateway>, publisher: DynPublisher) -> Self { Self { store, gateway, publisher } }

    /// Process a VNPAY IPN. Always answers with one of the gateway's response codes.
    pub async fn handle_ipn(&self, params: &HashMap<String, String>) -> IpnResponse {
        let confirmation = match self.gateway.verify(params) {
            Ok(confirmation) => confirmation,
            Err(PaymentError::InvalidSignature) => {
                warn!("VNPAY IPN with invalid signature");
                return IpnResponse::INVALID_SIGNATURE;
            }
            Err(e) => {
                warn!("Malformed VNPAY IPN: {e}");
                return IpnResponse::UNKNOWN_ERROR;
            }
        };

        let payment = match self.store.payment_by_txn_ref(&confirmation.txn_ref).await {
            Ok(Some(payment)) if payment.method == PaymentMethod::Vnpay => payment,
            Ok(_) => return IpnResponse::ORDER_NOT_FOUND,
            Err(e) => {
                error!(txn_ref = %confirmation.txn_ref, "❌ Failed to load payment: {e:?}");
                return IpnResponse::UNKNOWN_ERROR;
            }
        };
        if payment.amount != confirmation.amount {
            warn!(txn_ref = %payment.txn_ref, expected = payment.amount.amount(), actual = confirmation.amount.amount(), "VNPAY amount mismatch");
            return IpnResponse::INVALID_AMOUNT;
        }
        // A declined attempt may still be followed by a successful retry on the same txn_ref.
        let settled = match payment.status {
            PaymentStatus::Paid | PaymentStatus::Refunded => true,
            PaymentStatus::Failed => !confirmation.success,
            PaymentStatus::Pending => false,
        };
        if settled {
            return IpnResponse::ALREADY_CONFIRMED;
        }

        match self.store.record_gateway_result(&confirmation, Utc::now()).await {
            Ok((payment, PaymentOutcome::Paid)) => {
                info!(order_id = %payment.order_id, amount = payment.amount.amount(), "💰 VNPAY payment confirmed");
                self.publisher.publish(&DomainEvent::PaymentCompleted { payment_id: payment.id, order_id: payment.order_id, amount: payment.amount }).await;
                IpnResponse::CONFIRMED
            }
            Ok((payment, PaymentOutcome::Failed)) => {
                info!(order_id = %payment.order_id, response_code = %confirmation.response_code, "VNPAY payment failed");
                IpnResponse::CONFIRMED
            }
            Ok((_, PaymentOutcome::AlreadyPaid)) => IpnResponse::ALREADY_CONFIRMED,
            Err(crate::MarketplaceError::Payment(PaymentError::AmountMismatch { .. })) => IpnResponse::INVALID_AMOUNT,
            Err(e) => {
                error!(txn_ref = %confirmation.txn_ref, "❌ Failed to record VNPAY result: {e:?}");
                IpnResponse::UNKNOWN_ERROR
            }
        }
    }

    /// Verify the browser return. State only ever changes through the IPN.
    pub async fn verify_return(&self, params: &HashMap<String, String>) -> Result<PaymentReturn> {
        let confirmation = self.gateway.verify(params)?;
        let payment = self.store.payment_by_txn_ref(&confirmation.txn_ref).await?;
        Ok(PaymentReturn {
            payment_status: payment.map(|p| p.status),
            txn_ref: confirmation.txn_ref,
            amount: confirmation.amount,
            success: confirmation.success,
            response_code: confirmation.response_code,
            transaction_no: confirmation.transaction_no,
        })
    }
}
