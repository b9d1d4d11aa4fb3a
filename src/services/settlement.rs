//! Store settlements and refunds.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;
use crate::domain::aggregates::{EligibleSubOrder, OrderError, Refund, Settlement, SettlementError, SettlementPeriod};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::Money;
use crate::messaging::DynPublisher;
use crate::store::{DynStore, SettlementDetail};
use crate::{MarketplaceError, Result};

#[derive(Clone)]
pub struct SettlementService {
    store: DynStore,
    publisher: DynPublisher,
    commission_rate: Decimal,
}

impl SettlementService {
    pub fn new(store: DynStore, publisher: DynPublisher, commission_rate: Decimal) -> Self { Self { store, publisher, commission_rate } }

    pub async fn eligible(&self, store_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<EligibleSubOrder>> {
        let period = SettlementPeriod::new(start, end)?;
        self.store.eligible_sub_orders(store_id, &period).await
    }

    pub async fn create(&self, store_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<SettlementDetail> {
        let period = SettlementPeriod::new(start, end)?;
        let detail = self.store.create_settlement(store_id, &period, self.commission_rate, Utc::now()).await?;
        let settlement = &detail.settlement;
        info!(
            settlement_id = %settlement.id, store_id = %store_id, items = detail.items.len(),
            net = settlement.net_amount.amount(), "🧾 Settlement created"
        );
        self.publisher.publish(&DomainEvent::SettlementCreated {
            settlement_id: settlement.id, store_id, net_amount: settlement.net_amount, item_count: detail.items.len(),
        }).await;
        Ok(detail)
    }

    pub async fn list(&self, store_id: Uuid) -> Result<Vec<Settlement>> { self.store.settlements_for_store(store_id).await }

    pub async fn detail(&self, id: Uuid) -> Result<SettlementDetail> {
        self.store.settlement(id).await?.ok_or(MarketplaceError::NotFound("settlement"))
    }

    pub async fn mark_paid(&self, id: Uuid, payout_reference: &str) -> Result<Settlement> {
        let reference = payout_reference.trim();
        if reference.is_empty() { return Err(MarketplaceError::Validation("payout_reference must not be empty".into())); }
        let settlement = self.store.mark_settlement_paid(id, reference, Utc::now()).await?;
        info!(settlement_id = %id, reference, "Settlement paid out");
        Ok(settlement)
    }

    /// Cancelling frees the sub-orders and refunds for the next settlement.
    pub async fn cancel(&self, id: Uuid) -> Result<Settlement> {
        let settlement = self.store.cancel_settlement(id).await?;
        info!(settlement_id = %id, "Settlement cancelled");
        Ok(settlement)
    }

    /// Buyer-requested refund on a delivered sub-order.
    pub async fn request_refund(&self, user_id: Uuid, sub_order_id: Uuid, amount: Money, reason: &str) -> Result<Refund> {
        if reason.trim().is_empty() { return Err(MarketplaceError::Validation("reason must not be empty".into())); }
        let sub = self.store.sub_order(sub_order_id).await?.ok_or(MarketplaceError::NotFound("sub-order"))?;
        let detail = self.store.order_detail(sub.order_id).await?.ok_or(MarketplaceError::NotFound("order"))?;
        if detail.order.user_id != user_id { return Err(OrderError::NotOwner.into()); }
        let refund = self.store.request_refund(sub_order_id, amount, reason.trim(), Utc::now()).await?;
        info!(refund_id = %refund.id, sub_order_id = %sub_order_id, amount = amount.amount(), "Refund requested");
        Ok(refund)
    }

    pub async fn decide_refund(&self, refund_id: Uuid, approve: bool) -> Result<Refund> {
        let refund = self.store.decide_refund(refund_id, approve, Utc::now()).await.map_err(|e| match e {
            MarketplaceError::Settlement(SettlementError::RefundNotFound) => MarketplaceError::NotFound("refund"),
            other => other,
        })?;
        info!(refund_id = %refund_id, status = refund.status.as_str(), "Refund decided");
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{PaymentMethod, RefundStatus, SettlementStatus};
    use crate::testing::{complete, fixture, place_order};
    use chrono::Duration;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) { (Utc::now() - Duration::days(1), Utc::now() + Duration::days(1)) }

    #[tokio::test]
    async fn test_settlement_deducts_commission_and_refunds() {
        let f = fixture().await;
        let detail = place_order(&f, PaymentMethod::Cod).await;
        complete(&f, &detail).await;
        let shirt_sub = detail.sub_orders.iter().find(|s| s.sub_order.store_id == f.store_a).unwrap();

        let refund = f.services.settlements.request_refund(f.buyer, shirt_sub.sub_order.id, Money::vnd(10_000), "torn sleeve").await.unwrap();
        assert_eq!(refund.status, RefundStatus::Pending);
        f.services.settlements.decide_refund(refund.id, true).await.unwrap();

        let (start, end) = window();
        assert_eq!(f.services.settlements.eligible(f.store_a, start, end).await.unwrap().len(), 1);
        let created = f.services.settlements.create(f.store_a, start, end).await.unwrap();
        let s = &created.settlement;
        assert_eq!(s.gross_amount, Money::vnd(150_000));
        assert_eq!(s.commission_amount, Money::vnd(7_500));
        assert_eq!(s.refund_amount, Money::vnd(10_000));
        assert_eq!(s.net_amount, Money::vnd(150_000 - 7_500 - 10_000));
        assert_eq!(created.items.len(), 1);
        assert_eq!(created.refunds.len(), 1);
        assert!(f.publisher.kinds().contains(&"settlement_created"));

        assert!(matches!(
            f.services.settlements.create(f.store_a, start, end).await,
            Err(MarketplaceError::Settlement(SettlementError::NothingToSettle))
        ));
        assert_eq!(f.services.settlements.list(f.store_a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_makes_sub_orders_eligible_again() {
        let f = fixture().await;
        let detail = place_order(&f, PaymentMethod::Cod).await;
        complete(&f, &detail).await;
        let (start, end) = window();
        let settlements = &f.services.settlements;

        let first = settlements.create(f.store_b, start, end).await.unwrap();
        assert!(settlements.eligible(f.store_b, start, end).await.unwrap().is_empty());
        assert_eq!(settlements.cancel(first.settlement.id).await.unwrap().status, SettlementStatus::Cancelled);
        assert_eq!(settlements.eligible(f.store_b, start, end).await.unwrap().len(), 1);

        let second = settlements.create(f.store_b, start, end).await.unwrap();
        assert!(matches!(settlements.mark_paid(second.settlement.id, "  ").await, Err(MarketplaceError::Validation(_))));
        let paid = settlements.mark_paid(second.settlement.id, "VCB-20261018-001").await.unwrap();
        assert_eq!(paid.status, SettlementStatus::Paid);
        assert_eq!(paid.payout_reference.as_deref(), Some("VCB-20261018-001"));
        assert!(matches!(
            settlements.cancel(second.settlement.id).await,
            Err(MarketplaceError::Settlement(SettlementError::InvalidTransition { .. }))
        ));
        assert!(matches!(settlements.detail(Uuid::now_v7()).await, Err(MarketplaceError::NotFound("settlement"))));
    }

    #[tokio::test]
    async fn test_refund_rules() {
        let f = fixture().await;
        let detail = place_order(&f, PaymentMethod::Cod).await;
        let sub = &detail.sub_orders[0];
        let settlements = &f.services.settlements;

        assert!(matches!(
            settlements.request_refund(f.buyer, sub.sub_order.id, Money::vnd(1_000), "changed my mind").await,
            Err(MarketplaceError::Settlement(SettlementError::Order(OrderError::NotRefundable(_))))
        ));
        complete(&f, &detail).await;
        assert!(matches!(
            settlements.request_refund(Uuid::now_v7(), sub.sub_order.id, Money::vnd(1_000), "not mine").await,
            Err(MarketplaceError::Order(OrderError::NotOwner))
        ));
        let too_much = sub.sub_order.total.amount() + 1;
        assert!(matches!(
            settlements.request_refund(f.buyer, sub.sub_order.id, Money::vnd(too_much), "everything").await,
            Err(MarketplaceError::Settlement(SettlementError::RefundExceedsRemaining { .. }))
        ));
        let refund = settlements.request_refund(f.buyer, sub.sub_order.id, Money::vnd(5_000), "scratch").await.unwrap();
        assert_eq!(settlements.decide_refund(refund.id, false).await.unwrap().status, RefundStatus::Rejected);
        assert!(matches!(
            settlements.decide_refund(refund.id, true).await,
            Err(MarketplaceError::Settlement(SettlementError::RefundAlreadyDecided(RefundStatus::Rejected)))
        ));
        assert!(matches!(settlements.decide_refund(Uuid::now_v7(), true).await, Err(MarketplaceError::NotFound("refund"))));
    }
}
