//! Settlement Aggregate
//!
//! A settlement batches a store's completed sub-orders for one period into a payout.
//! Items snapshot the money breakdown so later edits never change a settled amount.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::order::{OrderError, SubOrder, SubOrderStatus};
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub store_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: SettlementStatus,
    pub gross_amount: Money,
    pub discount_amount: Money,
    pub commission_amount: Money,
    pub refund_amount: Money,
    /// May be negative when refunds outweigh sales.
    pub net_amount: Money,
    pub commission_rate: Decimal,
    pub payout_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementItem {
    pub id: Uuid,
    pub settlement_id: Uuid,
    pub sub_order_id: Uuid,
    pub order_code: String,
    pub items_subtotal: Money,
    pub store_discount: Money,
    pub commission: Money,
    pub net_amount: Money,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub sub_order_id: Uuid,
    pub store_id: Uuid,
    pub amount: Money,
    pub reason: String,
    pub status: RefundStatus,
    /// Return refunds come out of the store's payout; cancellation refunds do not,
    /// the store was never paid for those goods.
    pub chargeable_to_store: bool,
    pub settlement_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus { Pending, Paid, Cancelled }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus { Pending, Approved, Rejected }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPeriod { pub start: DateTime<Utc>, pub end: DateTime<Utc> }

/// A completed sub-order together with its order code, ready to be snapshotted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleSubOrder {
    pub sub_order: SubOrder,
    pub order_code: String,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Paid => "paid", Self::Cancelled => "cancelled" }
    }
}

impl FromStr for SettlementStatus {
    type Err = SettlementError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SettlementError::Corrupt(format!("unknown settlement status {other}"))),
        }
    }
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Approved => "approved", Self::Rejected => "rejected" }
    }
}

impl FromStr for RefundStatus {
    type Err = SettlementError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(SettlementError::Corrupt(format!("unknown refund status {other}"))),
        }
    }
}

impl SettlementPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SettlementError> {
        if start >= end { return Err(SettlementError::InvalidPeriod); }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool { at >= self.start && at < self.end }
}

/// Whether `sub` may go into a settlement of `store_id` for `period`.
pub fn is_eligible(sub: &SubOrder, store_id: Uuid, period: &SettlementPeriod) -> bool {
    sub.store_id == store_id
        && sub.status == SubOrderStatus::Completed
        && sub.settlement_id.is_none()
        && sub.completed_at.is_some_and(|at| period.contains(at))
}

impl Settlement {
    /// Aggregate eligible sub-orders and approved refunds into a new settlement.
    pub fn build(store_id: Uuid, period: SettlementPeriod, commission_rate: Decimal, eligible: &[EligibleSubOrder], refunds: &[Refund], now: DateTime<Utc>) -> Result<(Settlement, Vec<SettlementItem>), SettlementError> {
        if commission_rate < Decimal::ZERO || commission_rate > Decimal::ONE {
            return Err(SettlementError::InvalidCommissionRate(commission_rate));
        }
        let id = Uuid::now_v7();
        let mut items = Vec::with_capacity(eligible.len());
        for entry in eligible {
            let sub = &entry.sub_order;
            if !is_eligible(sub, store_id, &period) { return Err(SettlementError::NotEligible(sub.id)); }
            let base = sub.items_subtotal.saturating_sub(sub.store_discount);
            let commission = base.apply_rate(commission_rate);
            items.push(SettlementItem {
                id: Uuid::now_v7(), settlement_id: id, sub_order_id: sub.id, order_code: entry.order_code.clone(),
                items_subtotal: sub.items_subtotal, store_discount: sub.store_discount, commission,
                net_amount: base.minus(commission), completed_at: sub.completed_at.unwrap_or(now),
            });
        }
        let refunds: Vec<&Refund> = refunds.iter().filter(|r| r.store_id == store_id && r.is_settleable()).collect();
        if items.is_empty() && refunds.is_empty() { return Err(SettlementError::NothingToSettle); }

        let gross_amount: Money = items.iter().map(|i| i.items_subtotal).sum();
        let discount_amount: Money = items.iter().map(|i| i.store_discount).sum();
        let commission_amount: Money = items.iter().map(|i| i.commission).sum();
        let refund_amount: Money = refunds.iter().map(|r| r.amount).sum();
        let item_net: Money = items.iter().map(|i| i.net_amount).sum();
        let settlement = Settlement {
            id, store_id, period_start: period.start, period_end: period.end, status: SettlementStatus::Pending,
            gross_amount, discount_amount, commission_amount, refund_amount, net_amount: item_net.minus(refund_amount),
            commission_rate, payout_reference: None, created_at: now, paid_at: None,
        };
        Ok((settlement, items))
    }

    pub fn mark_paid(&mut self, reference: impl Into<String>, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if self.status != SettlementStatus::Pending {
            return Err(SettlementError::InvalidTransition { from: self.status, to: SettlementStatus::Paid });
        }
        self.status = SettlementStatus::Paid;
        self.payout_reference = Some(reference.into());
        self.paid_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), SettlementError> {
        if self.status != SettlementStatus::Pending {
            return Err(SettlementError::InvalidTransition { from: self.status, to: SettlementStatus::Cancelled });
        }
        self.status = SettlementStatus::Cancelled;
        Ok(())
    }
}

impl Refund {
    /// Open a refund against `sub`, bounded by what has not been refunded yet.
    pub fn request(sub: &SubOrder, amount: Money, reason: impl Into<String>, existing: &[Refund], now: DateTime<Utc>) -> Result<Refund, SettlementError> {
        sub.ensure_refundable()?;
        if amount <= Money::ZERO { return Err(SettlementError::InvalidRefundAmount(amount)); }
        let committed: Money = existing.iter()
            .filter(|r| r.sub_order_id == sub.id && r.status != RefundStatus::Rejected)
            .map(|r| r.amount)
            .sum();
        let remaining = sub.total.saturating_sub(committed);
        if amount > remaining { return Err(SettlementError::RefundExceedsRemaining { requested: amount, remaining }); }
        Ok(Refund {
            id: Uuid::now_v7(), sub_order_id: sub.id, store_id: sub.store_id, amount, reason: reason.into(),
            status: RefundStatus::Pending, chargeable_to_store: true, settlement_id: None, created_at: now, decided_at: None,
        })
    }

    /// Give the buyer back what they paid for a sub-order that will never ship.
    pub fn for_cancellation(sub: &SubOrder, now: DateTime<Utc>) -> Refund {
        Refund {
            id: Uuid::now_v7(), sub_order_id: sub.id, store_id: sub.store_id, amount: sub.total,
            reason: format!("sub-order {} cancelled after payment", sub.id), status: RefundStatus::Pending,
            chargeable_to_store: false, settlement_id: None, created_at: now, decided_at: None,
        }
    }

    pub fn decide(&mut self, approve: bool, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if self.status != RefundStatus::Pending { return Err(SettlementError::RefundAlreadyDecided(self.status)); }
        self.status = if approve { RefundStatus::Approved } else { RefundStatus::Rejected };
        self.decided_at = Some(now);
        Ok(())
    }

    pub fn is_settleable(&self) -> bool {
        self.chargeable_to_store && self.status == RefundStatus::Approved && self.settlement_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("settlement not found")]
    NotFound,
    #[error("refund not found")]
    RefundNotFound,
    #[error("settlement period must end after it starts")]
    InvalidPeriod,
    #[error("commission rate {0} must be between 0 and 1")]
    InvalidCommissionRate(Decimal),
    #[error("nothing to settle for this store and period")]
    NothingToSettle,
    #[error("sub-order {0} is not eligible for settlement")]
    NotEligible(Uuid),
    #[error("settlement cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: SettlementStatus, to: SettlementStatus },
    #[error("refund amount {0} must be positive")]
    InvalidRefundAmount(Money),
    #[error("refund of {requested} exceeds the remaining refundable {remaining}")]
    RefundExceedsRemaining { requested: Money, remaining: Money },
    #[error("refund was already {0:?}")]
    RefundAlreadyDecided(RefundStatus),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error("corrupt settlement record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn completed(store_id: Uuid, subtotal: i64, store_discount: i64, at: DateTime<Utc>) -> EligibleSubOrder {
        let mut sub = SubOrder {
            id: Uuid::now_v7(), order_id: Uuid::now_v7(), store_id, status: SubOrderStatus::Completed,
            items_subtotal: Money::vnd(subtotal), shipping_fee: Money::vnd(30_000), store_discount: Money::vnd(store_discount),
            platform_discount: Money::ZERO, shipping_discount: Money::ZERO, total: Money::ZERO,
            completed_at: Some(at), settlement_id: None, created_at: at, updated_at: at,
        };
        sub.recompute_total();
        EligibleSubOrder { sub_order: sub, order_code: "ORD-0000ABCD".into() }
    }

    fn period(now: DateTime<Utc>) -> SettlementPeriod {
        SettlementPeriod::new(now - Duration::days(7), now).unwrap()
    }

    #[test]
    fn test_build_settlement_aggregates_items() {
        let now = Utc::now();
        let store = Uuid::now_v7();
        let eligible = vec![completed(store, 200_000, 20_000, now - Duration::days(1)), completed(store, 100_000, 0, now - Duration::days(2))];
        let (s, items) = Settlement::build(store, period(now), Decimal::new(5, 2), &eligible, &[], now).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].commission, Money::vnd(9_000));
        assert_eq!(items[0].net_amount, Money::vnd(171_000));
        assert_eq!(s.gross_amount, Money::vnd(300_000));
        assert_eq!(s.commission_amount, Money::vnd(14_000));
        assert_eq!(s.net_amount, Money::vnd(266_000));
        assert_eq!(s.status, SettlementStatus::Pending);
    }

    #[test]
    fn test_refunds_reduce_net_and_may_go_negative() {
        let now = Utc::now();
        let store = Uuid::now_v7();
        let refund = Refund {
            id: Uuid::now_v7(), sub_order_id: Uuid::now_v7(), store_id: store, amount: Money::vnd(50_000), reason: "damaged".into(),
            status: RefundStatus::Approved, chargeable_to_store: true, settlement_id: None, created_at: now, decided_at: Some(now),
        };
        let mut cancellation = refund.clone();
        cancellation.id = Uuid::now_v7();
        cancellation.chargeable_to_store = false;
        let (s, items) = Settlement::build(store, period(now), Decimal::ZERO, &[], &[refund, cancellation], now).unwrap();
        assert!(items.is_empty());
        assert_eq!(s.refund_amount, Money::vnd(50_000));
        assert_eq!(s.net_amount.amount(), -50_000);
    }

    #[test]
    fn test_nothing_to_settle_and_ineligible() {
        let now = Utc::now();
        let store = Uuid::now_v7();
        assert_eq!(Settlement::build(store, period(now), Decimal::ZERO, &[], &[], now).unwrap_err(), SettlementError::NothingToSettle);
        let outside = completed(store, 100_000, 0, now - Duration::days(30));
        assert_eq!(Settlement::build(store, period(now), Decimal::ZERO, &[outside.clone()], &[], now).unwrap_err(), SettlementError::NotEligible(outside.sub_order.id));
        assert_eq!(SettlementPeriod::new(now, now).unwrap_err(), SettlementError::InvalidPeriod);
    }

    #[test]
    fn test_settlement_transitions() {
        let now = Utc::now();
        let store = Uuid::now_v7();
        let (mut s, _) = Settlement::build(store, period(now), Decimal::ZERO, &[completed(store, 10_000, 0, now - Duration::hours(1))], &[], now).unwrap();
        s.mark_paid("BANK-TX-1", now).unwrap();
        assert_eq!(s.payout_reference.as_deref(), Some("BANK-TX-1"));
        assert_eq!(s.cancel(), Err(SettlementError::InvalidTransition { from: SettlementStatus::Paid, to: SettlementStatus::Cancelled }));
    }

    #[test]
    fn test_refund_bounded_by_remaining() {
        let now = Utc::now();
        let sub = completed(Uuid::now_v7(), 100_000, 0, now).sub_order;
        let first = Refund::request(&sub, Money::vnd(100_000), "wrong size", &[], now).unwrap();
        let err = Refund::request(&sub, Money::vnd(40_000), "again", &[first.clone()], now).unwrap_err();
        assert_eq!(err, SettlementError::RefundExceedsRemaining { requested: Money::vnd(40_000), remaining: Money::vnd(30_000) });
        let mut rejected = first;
        rejected.decide(false, now).unwrap();
        assert!(Refund::request(&sub, Money::vnd(130_000), "full", &[rejected.clone()], now).is_ok());
        assert_eq!(rejected.decide(true, now), Err(SettlementError::RefundAlreadyDecided(RefundStatus::Rejected)));
    }
}
