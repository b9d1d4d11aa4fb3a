//! Voucher Aggregate
//!
//! Usage is counted as consumed reservations plus active reservations that have not
//! yet expired, so a hold taken at checkout blocks the slot until it is released,
//! consumed by an order, or swept as expired.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::value_objects::{Money, VoucherCode};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: Uuid,
    pub code: VoucherCode,
    pub scope: VoucherScope,
    pub discount: Discount,
    pub max_discount: Option<Money>,
    pub min_order_value: Money,
    pub usage_limit: Option<u32>,
    pub per_user_limit: Option<u32>,
    /// `None` for platform-funded vouchers.
    pub store_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherScope { Order, Shipping }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount { Percentage(Decimal), Fixed(Money) }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoucherUsage { pub total: u32, pub by_user: u32 }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherReservation {
    pub id: Uuid,
    pub voucher_id: Uuid,
    pub user_id: Uuid,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub order_id: Option<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus { Active, Consumed, Released, Expired }

impl VoucherScope {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Order => "order", Self::Shipping => "shipping" }
    }
}

impl FromStr for VoucherScope {
    type Err = VoucherError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(Self::Order),
            "shipping" => Ok(Self::Shipping),
            other => Err(VoucherError::Corrupt(format!("unknown voucher scope {other}"))),
        }
    }
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Active => "active", Self::Consumed => "consumed", Self::Released => "released", Self::Expired => "expired" }
    }
}

impl FromStr for ReservationStatus {
    type Err = VoucherError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "consumed" => Ok(Self::Consumed),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(VoucherError::Corrupt(format!("unknown reservation status {other}"))),
        }
    }
}

impl Voucher {
    pub fn is_platform_funded(&self) -> bool { self.store_id.is_none() }

    /// Shape checks for a newly created voucher.
    pub fn validate(&self) -> Result<(), VoucherError> {
        if self.ends_at <= self.starts_at { return Err(VoucherError::Invalid("ends_at must be after starts_at".into())); }
        match self.discount {
            Discount::Percentage(pct) if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED => {
                return Err(VoucherError::Invalid(format!("percentage {pct} must be within (0, 100]")));
            }
            Discount::Fixed(amount) if amount <= Money::ZERO => {
                return Err(VoucherError::Invalid("fixed discount must be positive".into()));
            }
            _ => {}
        }
        if self.max_discount.is_some_and(|cap| cap <= Money::ZERO) {
            return Err(VoucherError::Invalid("max_discount must be positive".into()));
        }
        if self.min_order_value < Money::ZERO { return Err(VoucherError::Invalid("min_order_value must not be negative".into())); }
        if self.usage_limit == Some(0) || self.per_user_limit == Some(0) {
            return Err(VoucherError::Invalid("limits must be at least 1 when set".into()));
        }
        Ok(())
    }

    /// Validate that one more redemption by this user is allowed right now.
    pub fn check_redeemable(&self, usage: VoucherUsage, eligible_amount: Money, now: DateTime<Utc>) -> Result<(), VoucherError> {
        if !self.is_active { return Err(VoucherError::Inactive); }
        if now < self.starts_at { return Err(VoucherError::NotStarted); }
        if now >= self.ends_at { return Err(VoucherError::Expired); }
        if let Some(limit) = self.usage_limit {
            if usage.total >= limit { return Err(VoucherError::UsageLimitReached); }
        }
        if let Some(limit) = self.per_user_limit {
            if usage.by_user >= limit { return Err(VoucherError::UserLimitReached); }
        }
        if eligible_amount < self.min_order_value {
            return Err(VoucherError::MinimumNotMet { required: self.min_order_value, actual: eligible_amount });
        }
        Ok(())
    }

    /// Discount granted on `base`, capped by `max_discount` and never above `base`.
    pub fn discount_for(&self, base: Money) -> Money {
        let raw = match self.discount {
            Discount::Percentage(pct) => base.apply_rate(pct / Decimal::ONE_HUNDRED),
            Discount::Fixed(amount) => amount,
        };
        let capped = match self.max_discount { Some(cap) => raw.min(cap), None => raw };
        capped.min(base).max(Money::ZERO)
    }

    pub fn reserve_for(&self, user_id: Uuid, now: DateTime<Utc>, ttl: Duration) -> VoucherReservation {
        VoucherReservation {
            id: Uuid::now_v7(), voucher_id: self.id, user_id, status: ReservationStatus::Active,
            reserved_at: now, expires_at: now + ttl, order_id: None,
        }
    }
}

impl VoucherReservation {
    /// Whether this reservation still holds a usage slot at `now`.
    pub fn counts_towards_usage(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ReservationStatus::Consumed => true,
            ReservationStatus::Active => self.expires_at > now,
            ReservationStatus::Released | ReservationStatus::Expired => false,
        }
    }

    pub fn ensure_consumable(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), VoucherError> {
        if self.user_id != user_id { return Err(VoucherError::NotOwner); }
        match self.status {
            ReservationStatus::Active if self.expires_at > now => Ok(()),
            ReservationStatus::Active | ReservationStatus::Expired => Err(VoucherError::ReservationExpired),
            ReservationStatus::Consumed | ReservationStatus::Released => Err(VoucherError::ReservationNotActive),
        }
    }

    pub fn consume(&mut self, order_id: Uuid, now: DateTime<Utc>) -> Result<(), VoucherError> {
        self.ensure_consumable(self.user_id, now)?;
        self.status = ReservationStatus::Consumed;
        self.order_id = Some(order_id);
        Ok(())
    }

    /// Returns `true` when the reservation actually changed.
    pub fn release(&mut self, user_id: Uuid) -> Result<bool, VoucherError> {
        if self.user_id != user_id { return Err(VoucherError::NotOwner); }
        if self.status != ReservationStatus::Active { return Ok(false); }
        self.status = ReservationStatus::Released;
        Ok(true)
    }

    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ReservationStatus::Active && self.expires_at <= now {
            self.status = ReservationStatus::Expired;
            return true;
        }
        false
    }
}

/// Count the usage a set of reservations represents for `user_id`.
pub fn usage_of<'a>(reservations: impl IntoIterator<Item = &'a VoucherReservation>, user_id: Uuid, now: DateTime<Utc>) -> VoucherUsage {
    reservations.into_iter().filter(|r| r.counts_towards_usage(now)).fold(VoucherUsage::default(), |mut usage, r| {
        usage.total += 1;
        if r.user_id == user_id { usage.by_user += 1; }
        usage
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoucherError {
    #[error("voucher not found")]
    NotFound,
    #[error("voucher code already exists")]
    DuplicateCode,
    #[error("voucher is not active")]
    Inactive,
    #[error("voucher is not valid yet")]
    NotStarted,
    #[error("voucher has expired")]
    Expired,
    #[error("voucher usage limit reached")]
    UsageLimitReached,
    #[error("voucher already used the maximum number of times by this user")]
    UserLimitReached,
    #[error("order value {actual} is below the voucher minimum {required}")]
    MinimumNotMet { required: Money, actual: Money },
    #[error("voucher reservation not found")]
    ReservationNotFound,
    #[error("voucher reservation belongs to another user")]
    NotOwner,
    #[error("voucher reservation has expired")]
    ReservationExpired,
    #[error("voucher reservation is no longer active")]
    ReservationNotActive,
    #[error("voucher does not apply here: {0}")]
    NotApplicable(String),
    #[error("invalid voucher: {0}")]
    Invalid(String),
    #[error("corrupt voucher record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voucher(discount: Discount) -> Voucher {
        let now = Utc::now();
        Voucher {
            id: Uuid::now_v7(), code: VoucherCode::new("SALE").unwrap(), scope: VoucherScope::Order, discount,
            max_discount: None, min_order_value: Money::vnd(100_000), usage_limit: Some(2), per_user_limit: Some(1),
            store_id: None, starts_at: now - Duration::days(1), ends_at: now + Duration::days(1), is_active: true,
        }
    }

    #[test]
    fn test_percentage_discount_is_capped() {
        let mut v = voucher(Discount::Percentage(Decimal::new(10, 0)));
        assert_eq!(v.discount_for(Money::vnd(250_000)), Money::vnd(25_000));
        v.max_discount = Some(Money::vnd(20_000));
        assert_eq!(v.discount_for(Money::vnd(250_000)), Money::vnd(20_000));
    }

    #[test]
    fn test_fixed_discount_never_exceeds_base() {
        let v = voucher(Discount::Fixed(Money::vnd(50_000)));
        assert_eq!(v.discount_for(Money::vnd(30_000)), Money::vnd(30_000));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(voucher(Discount::Percentage(Decimal::new(15, 0))).validate().is_ok());
        assert!(matches!(voucher(Discount::Percentage(Decimal::new(101, 0))).validate(), Err(VoucherError::Invalid(_))));
        assert!(matches!(voucher(Discount::Fixed(Money::ZERO)).validate(), Err(VoucherError::Invalid(_))));
        let mut v = voucher(Discount::Fixed(Money::vnd(10_000)));
        v.ends_at = v.starts_at;
        assert!(matches!(v.validate(), Err(VoucherError::Invalid(_))));
    }

    #[test]
    fn test_redeemable_checks() {
        let now = Utc::now();
        let v = voucher(Discount::Fixed(Money::vnd(10_000)));
        assert!(v.check_redeemable(VoucherUsage::default(), Money::vnd(100_000), now).is_ok());
        assert_eq!(v.check_redeemable(VoucherUsage { total: 2, by_user: 0 }, Money::vnd(100_000), now), Err(VoucherError::UsageLimitReached));
        assert_eq!(v.check_redeemable(VoucherUsage { total: 1, by_user: 1 }, Money::vnd(100_000), now), Err(VoucherError::UserLimitReached));
        assert!(matches!(v.check_redeemable(VoucherUsage::default(), Money::vnd(99_999), now), Err(VoucherError::MinimumNotMet { .. })));
        assert_eq!(v.check_redeemable(VoucherUsage::default(), Money::vnd(100_000), v.ends_at), Err(VoucherError::Expired));
        assert_eq!(v.check_redeemable(VoucherUsage::default(), Money::vnd(100_000), v.starts_at - Duration::seconds(1)), Err(VoucherError::NotStarted));
    }

    #[test]
    fn test_usage_counts_live_reservations_only() {
        let now = Utc::now();
        let v = voucher(Discount::Fixed(Money::vnd(10_000)));
        let buyer = Uuid::now_v7();
        let other = Uuid::now_v7();
        let live = v.reserve_for(buyer, now, Duration::minutes(15));
        let mut stale = v.reserve_for(other, now - Duration::minutes(30), Duration::minutes(15));
        let mut released = v.reserve_for(other, now, Duration::minutes(15));
        released.release(other).unwrap();
        assert_eq!(usage_of([&live, &stale, &released], buyer, now), VoucherUsage { total: 1, by_user: 1 });
        assert!(stale.expire_if_due(now));
        assert_eq!(stale.status, ReservationStatus::Expired);
    }

    #[test]
    fn test_consume_and_release() {
        let now = Utc::now();
        let v = voucher(Discount::Fixed(Money::vnd(10_000)));
        let buyer = Uuid::now_v7();
        let mut r = v.reserve_for(buyer, now, Duration::minutes(15));
        assert_eq!(r.ensure_consumable(Uuid::now_v7(), now), Err(VoucherError::NotOwner));
        r.consume(Uuid::now_v7(), now).unwrap();
        assert_eq!(r.status, ReservationStatus::Consumed);
        assert_eq!(r.release(buyer), Ok(false));
        assert_eq!(r.consume(Uuid::now_v7(), now), Err(VoucherError::ReservationNotActive));
        let mut late = v.reserve_for(buyer, now - Duration::hours(1), Duration::minutes(15));
        assert_eq!(late.consume(Uuid::now_v7(), now), Err(VoucherError::ReservationExpired));
    }
}
