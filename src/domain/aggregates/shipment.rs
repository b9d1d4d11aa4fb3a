//! Shipment Aggregate
//!
//! One shipment per sub-order, mirroring the carrier's view of the parcel. Carrier
//! updates arrive through webhooks and polling, possibly duplicated or out of order,
//! so every update goes through [`Shipment::apply`] which only ever moves forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::order::SubOrderStatus;
use crate::domain::aggregates::variant::Address;
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: Uuid,
    pub sub_order_id: Uuid,
    pub carrier: String,
    pub label: Option<String>,
    pub status: ShipmentStatus,
    pub fee: Money,
    pub carrier_status_code: Option<i32>,
    pub last_error: Option<String>,
    pub estimated_delivery: Option<String>,
    pub pickup_address: Address,
    pub delivery_address: Address,
    pub weight_grams: u32,
    /// Amount the carrier collects from the buyer on delivery.
    pub cod_amount: Money,
    pub declared_value: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    #[default]
    Pending,
    Created,
    Accepted,
    PickingUp,
    PickedUp,
    Delivering,
    Delivered,
    Completed,
    PickupFailed,
    DeliveryFailed,
    Returning,
    Returned,
    Cancelled,
    Lost,
}

/// Carrier order as acknowledged by the carrier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierOrder {
    pub label: String,
    pub fee: Money,
    pub estimated_delivery: Option<String>,
    pub status_code: Option<i32>,
}

/// A status report from the carrier, already mapped to our vocabulary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierUpdate {
    pub label: String,
    pub status_code: i32,
    /// `None` when the carrier code has no meaning for us.
    pub status: Option<ShipmentStatus>,
    pub action_time: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShipmentUpdateOutcome {
    Applied { from: ShipmentStatus, to: ShipmentStatus },
    /// Same status reported again, e.g. a delay notice.
    Unchanged,
    /// Older than what we already know.
    Stale { current: ShipmentStatus, reported: ShipmentStatus },
    /// Exact update already processed.
    Duplicate,
    /// Carrier code we do not track.
    Ignored,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending", Self::Created => "created", Self::Accepted => "accepted",
            Self::PickingUp => "picking_up", Self::PickedUp => "picked_up", Self::Delivering => "delivering",
            Self::Delivered => "delivered", Self::Completed => "completed", Self::PickupFailed => "pickup_failed",
            Self::DeliveryFailed => "delivery_failed", Self::Returning => "returning", Self::Returned => "returned",
            Self::Cancelled => "cancelled", Self::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Returned | Self::Cancelled | Self::Lost) }

    /// Position on the happy path; failure states sit at the step they failed on.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Created => Some(1),
            Self::Accepted => Some(2),
            Self::PickingUp | Self::PickupFailed => Some(3),
            Self::PickedUp => Some(4),
            Self::Delivering | Self::DeliveryFailed => Some(5),
            Self::Delivered => Some(6),
            Self::Completed => Some(7),
            Self::Returning | Self::Returned | Self::Cancelled | Self::Lost => None,
        }
    }

    fn is_progress(&self) -> bool {
        !matches!(self, Self::PickupFailed | Self::DeliveryFailed | Self::Returning | Self::Returned | Self::Cancelled | Self::Lost)
    }

    /// Whether the parcel has not left the seller yet.
    pub fn before_pickup(&self) -> bool {
        matches!(self, Self::Pending | Self::Created | Self::Accepted | Self::PickingUp | Self::PickupFailed)
    }

    pub fn can_transition_to(&self, next: ShipmentStatus) -> bool {
        use ShipmentStatus::*;
        if self.is_terminal() || *self == next { return false; }
        match next {
            Cancelled => self.before_pickup(),
            PickupFailed => matches!(self, Created | Accepted | PickingUp),
            DeliveryFailed => matches!(self, PickedUp | Delivering),
            Returning => matches!(self, PickedUp | Delivering | DeliveryFailed | Delivered),
            Returned => matches!(self, PickedUp | Delivering | DeliveryFailed | Delivered | Returning),
            Lost => true,
            _ => match (self.rank(), next.rank()) {
                (Some(from), Some(to)) if self.is_progress() => to > from,
                (Some(from), Some(to)) => to >= from,
                _ => false,
            },
        }
    }

    /// Sub-order status implied by this shipment status.
    pub fn sub_order_status(&self) -> SubOrderStatus {
        match self {
            Self::Pending => SubOrderStatus::Pending,
            Self::Created | Self::Accepted | Self::PickingUp | Self::PickupFailed => SubOrderStatus::Confirmed,
            Self::PickedUp | Self::Delivering | Self::DeliveryFailed | Self::Returning => SubOrderStatus::Shipping,
            Self::Delivered => SubOrderStatus::Delivered,
            Self::Completed => SubOrderStatus::Completed,
            Self::Returned => SubOrderStatus::Returned,
            Self::Cancelled | Self::Lost => SubOrderStatus::Cancelled,
        }
    }
}

impl ShipmentUpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied", Self::Unchanged => "unchanged", Self::Stale { .. } => "stale",
            Self::Duplicate => "duplicate", Self::Ignored => "ignored",
        }
    }
}

impl FromStr for ShipmentStatus {
    type Err = ShipmentError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ShipmentStatus::*;
        let status = match s {
            "pending" => Pending, "created" => Created, "accepted" => Accepted, "picking_up" => PickingUp,
            "picked_up" => PickedUp, "delivering" => Delivering, "delivered" => Delivered, "completed" => Completed,
            "pickup_failed" => PickupFailed, "delivery_failed" => DeliveryFailed, "returning" => Returning,
            "returned" => Returned, "cancelled" => Cancelled, "lost" => Lost,
            other => return Err(ShipmentError::Corrupt(format!("unknown shipment status {other}"))),
        };
        Ok(status)
    }
}

impl Shipment {
    #[allow(clippy::too_many_arguments)]
    pub fn pending(sub_order_id: Uuid, carrier: &str, pickup_address: Address, delivery_address: Address, weight_grams: u32, fee: Money, cod_amount: Money, declared_value: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(), sub_order_id, carrier: carrier.to_string(), label: None, status: ShipmentStatus::Pending,
            fee, carrier_status_code: None, last_error: None, estimated_delivery: None, pickup_address, delivery_address,
            weight_grams, cod_amount, declared_value, created_at: now, updated_at: now,
        }
    }

    pub fn is_in_flight(&self) -> bool { self.label.is_some() && !self.status.is_terminal() }

    pub fn record_carrier_order(&mut self, order: &CarrierOrder, now: DateTime<Utc>) -> Result<(), ShipmentError> {
        if self.status != ShipmentStatus::Pending || self.label.is_some() {
            return Err(ShipmentError::AlreadyRegistered(self.label.clone().unwrap_or_default()));
        }
        self.label = Some(order.label.clone());
        self.fee = order.fee;
        self.estimated_delivery = order.estimated_delivery.clone();
        self.carrier_status_code = order.status_code;
        self.status = ShipmentStatus::Created;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn record_carrier_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// Apply a carrier update. Duplicate detection is the caller's job since it needs
    /// the full update history.
    pub fn apply(&mut self, update: &CarrierUpdate, now: DateTime<Utc>) -> ShipmentUpdateOutcome {
        let Some(reported) = update.status else {
            self.carrier_status_code = Some(update.status_code);
            self.updated_at = now;
            return ShipmentUpdateOutcome::Ignored;
        };
        if reported == self.status {
            self.carrier_status_code = Some(update.status_code);
            self.updated_at = now;
            return ShipmentUpdateOutcome::Unchanged;
        }
        if !self.status.can_transition_to(reported) {
            return ShipmentUpdateOutcome::Stale { current: self.status, reported };
        }
        let from = self.status;
        self.status = reported;
        self.carrier_status_code = Some(update.status_code);
        self.updated_at = now;
        ShipmentUpdateOutcome::Applied { from, to: reported }
    }

    pub fn ensure_cancellable(&self) -> Result<(), ShipmentError> {
        if !self.status.can_transition_to(ShipmentStatus::Cancelled) {
            return Err(ShipmentError::NotCancellable(self.status));
        }
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<ShipmentStatus, ShipmentError> {
        self.ensure_cancellable()?;
        let from = self.status;
        self.status = ShipmentStatus::Cancelled;
        self.updated_at = now;
        Ok(from)
    }
}

/// Key used to recognise an update we already processed.
pub fn update_key(shipment_id: Uuid, update: &CarrierUpdate) -> String {
    format!("{shipment_id}:{}:{}", update.status_code, update.action_time.timestamp())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShipmentError {
    #[error("shipment not found")]
    NotFound,
    #[error("shipment already registered with the carrier as {0}")]
    AlreadyRegistered(String),
    #[error("shipment in status {0:?} can no longer be cancelled")]
    NotCancellable(ShipmentStatus),
    #[error("corrupt shipment record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ShipmentStatus::*;

    fn shipment() -> Shipment {
        Shipment::pending(Uuid::now_v7(), "ghtk", Address::default(), Address::default(), 500, Money::vnd(30_000), Money::ZERO, Money::vnd(200_000), Utc::now())
    }

    fn update(code: i32, status: Option<ShipmentStatus>) -> CarrierUpdate {
        CarrierUpdate { label: "S1.A1.123".into(), status_code: code, status, action_time: Utc::now(), reason: None }
    }

    #[test]
    fn test_forward_transitions_only() {
        assert!(Created.can_transition_to(PickedUp));
        assert!(Delivered.can_transition_to(Completed));
        assert!(!Delivering.can_transition_to(PickingUp));
        assert!(!Completed.can_transition_to(Returned));
        assert!(PickupFailed.can_transition_to(PickingUp));
        assert!(DeliveryFailed.can_transition_to(Delivering));
        assert!(!DeliveryFailed.can_transition_to(PickedUp));
        assert!(!PickedUp.can_transition_to(Cancelled));
        assert!(Returning.can_transition_to(Returned));
        assert!(!Returning.can_transition_to(Delivered));
    }

    #[test]
    fn test_apply_out_of_order_update_is_stale() {
        let mut s = shipment();
        s.record_carrier_order(&CarrierOrder { label: "S1.A1.123".into(), fee: Money::vnd(32_000), estimated_delivery: None, status_code: Some(1) }, Utc::now()).unwrap();
        assert_eq!(s.apply(&update(4, Some(Delivering)), Utc::now()), ShipmentUpdateOutcome::Applied { from: Created, to: Delivering });
        assert_eq!(s.apply(&update(3, Some(PickedUp)), Utc::now()), ShipmentUpdateOutcome::Stale { current: Delivering, reported: PickedUp });
        assert_eq!(s.apply(&update(10, Some(Delivering)), Utc::now()), ShipmentUpdateOutcome::Unchanged);
        assert_eq!(s.carrier_status_code, Some(10));
        assert_eq!(s.apply(&update(999, None), Utc::now()), ShipmentUpdateOutcome::Ignored);
        assert_eq!(s.status, Delivering);
    }

    #[test]
    fn test_record_carrier_order_once() {
        let mut s = shipment();
        let order = CarrierOrder { label: "S1.A1.9".into(), fee: Money::vnd(28_000), estimated_delivery: Some("2026-10-20".into()), status_code: Some(1) };
        s.record_carrier_order(&order, Utc::now()).unwrap();
        assert_eq!(s.status, Created);
        assert_eq!(s.fee, Money::vnd(28_000));
        assert!(s.is_in_flight());
        assert!(matches!(s.record_carrier_order(&order, Utc::now()), Err(ShipmentError::AlreadyRegistered(_))));
    }

    #[test]
    fn test_cancel_only_before_pickup() {
        let mut s = shipment();
        assert_eq!(s.cancel(Utc::now()), Ok(Pending));
        let mut picked = shipment();
        picked.status = PickedUp;
        assert_eq!(picked.cancel(Utc::now()), Err(ShipmentError::NotCancellable(PickedUp)));
    }

    #[test]
    fn test_sub_order_status_mapping() {
        assert_eq!(PickedUp.sub_order_status(), SubOrderStatus::Shipping);
        assert_eq!(Completed.sub_order_status(), SubOrderStatus::Completed);
        assert_eq!(Lost.sub_order_status(), SubOrderStatus::Cancelled);
    }
}
