//! Value Objects for the marketplace lifecycle

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use thiserror::Error;

/// Voucher code value object, normalised to uppercase
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VoucherCode(String);

impl VoucherCode {
    pub fn new(value: impl Into<String>) -> Result<Self, VoucherCodeError> {
        let value = value.into().trim().to_uppercase();
        if value.is_empty() { return Err(VoucherCodeError::Empty); }
        if value.len() > 32 { return Err(VoucherCodeError::TooLong); }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(VoucherCodeError::InvalidCharacter);
        }
        Ok(Self(value))
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for VoucherCode {
    type Error = VoucherCodeError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<VoucherCode> for String {
    fn from(code: VoucherCode) -> Self { code.0 }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoucherCodeError {
    #[error("voucher code is empty")]
    Empty,
    #[error("voucher code is longer than 32 characters")]
    TooLong,
    #[error("voucher code may only contain letters, digits, '-' and '_'")]
    InvalidCharacter,
}

/// Money value object: whole Vietnamese đồng
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn vnd(amount: i64) -> Self { Self(amount) }
    pub fn amount(&self) -> i64 { self.0 }
    pub fn is_zero(&self) -> bool { self.0 == 0 }
    pub fn multiply(&self, qty: u32) -> Money { Money(self.0.saturating_mul(i64::from(qty))) }

    /// Subtraction that bottoms out at zero.
    pub fn saturating_sub(&self, other: Money) -> Money { Money((self.0 - other.0).max(0)) }

    /// Signed subtraction, for payables that may go negative.
    pub fn minus(&self, other: Money) -> Money { Money(self.0 - other.0) }

    /// `self × rate`, rounded half away from zero to a whole đồng.
    pub fn apply_rate(&self, rate: Decimal) -> Money {
        let raw = Decimal::from(self.0) * rate;
        Money(raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero).to_i64().unwrap_or(0))
    }

    pub fn min(self, other: Money) -> Money { if self <= other { self } else { other } }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money { Money(self.0 + rhs.0) }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) { self.0 += rhs.0; }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money { iter.fold(Money::ZERO, |acc, m| acc + m) }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} VND", self.0) }
}

/// Quantity value object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Self { Self(value) }
    pub fn value(&self) -> u32 { self.0 }
    pub fn add(&self, other: u32) -> Self { Self(self.0.saturating_add(other)) }
    pub fn subtract(&self, other: u32) -> Option<Self> {
        if other > self.0 { None } else { Some(Self(self.0 - other)) }
    }
    pub fn is_zero(&self) -> bool { self.0 == 0 }
}

/// Split `total` across `weights` proportionally, largest remainder first, so the
/// parts always add up to `total` exactly. Zero weights receive nothing.
pub fn allocate_proportionally(total: Money, weights: &[Money]) -> Vec<Money> {
    let weight_sum: i64 = weights.iter().map(|w| w.amount().max(0)).sum();
    if weight_sum == 0 || total.is_zero() {
        return vec![Money::ZERO; weights.len()];
    }
    let total = i128::from(total.amount());
    let weight_sum = i128::from(weight_sum);
    let mut parts: Vec<(usize, i128, i128)> = weights
        .iter()
        .enumerate()
        .map(|(idx, w)| {
            let scaled = total * i128::from(w.amount().max(0));
            (idx, scaled / weight_sum, scaled % weight_sum)
        })
        .collect();
    let assigned: i128 = parts.iter().map(|(_, base, _)| *base).sum();
    let mut leftover = total - assigned;
    // Ties go to the earlier position to keep the split deterministic.
    parts.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    for part in parts.iter_mut() {
        if leftover == 0 { break; }
        if part.2 > 0 { part.1 += 1; leftover -= 1; }
    }
    parts.sort_by_key(|(idx, _, _)| *idx);
    parts.into_iter().map(|(_, amount, _)| Money::vnd(amount as i64)).collect()
}
