//! Order reads and buyer cancellation.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use crate::carrier::DynCarrier;
use crate::domain::aggregates::{OrderError, ShipmentStatus};
use crate::domain::events::DomainEvent;
use crate::messaging::DynPublisher;
use crate::store::{CancelledSubOrder, DynStore, OrderDetail};
use crate::{MarketplaceError, Result};

#[derive(Clone)]
pub struct OrderService {
    store: DynStore,
    carrier: DynCarrier,
    publisher: DynPublisher,
}

impl OrderService {
    pub fn new(store: DynStore, carrier: DynCarrier, publisher: DynPublisher) -> Self { Self { store, carrier, publisher } }

    /// Orders of other buyers read as missing.
    pub async fn order(&self, user_id: Uuid, order_id: Uuid) -> Result<OrderDetail> {
        match self.store.order_detail(order_id).await? {
            Some(detail) if detail.order.user_id == user_id => Ok(detail),
            _ => Err(MarketplaceError::NotFound("order")),
        }
    }

    pub async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<OrderDetail>> { self.store.orders_for_user(user_id).await }

    /// Cancel one sub-order before pickup. The carrier parcel is cancelled first; if the
    /// carrier refuses, nothing changes on our side.
    pub async fn cancel_sub_order(&self, user_id: Uuid, sub_order_id: Uuid) -> Result<CancelledSubOrder> {
        let sub = self.store.sub_order(sub_order_id).await?.ok_or(MarketplaceError::NotFound("sub-order"))?;
        let detail = self.store.order_detail(sub.order_id).await?.ok_or(MarketplaceError::NotFound("order"))?;
        if detail.order.user_id != user_id { return Err(OrderError::NotOwner.into()); }
        let shipment = detail.sub_orders.into_iter()
            .find(|s| s.sub_order.id == sub_order_id)
            .map(|s| s.shipment)
            .ok_or(MarketplaceError::NotFound("shipment"))?;
        shipment.ensure_cancellable()?;

        if let Some(label) = &shipment.label {
            self.carrier.cancel_order(label).await.map_err(|e| {
                warn!(label = %label, sub_order_id = %sub_order_id, "Carrier refused cancellation: {e}");
                MarketplaceError::from(e)
            })?;
        }

        let cancelled = self.store.cancel_sub_order(sub_order_id, user_id, Utc::now()).await?;
        info!(
            sub_order_id = %sub_order_id, order_id = %sub.order_id, refund = cancelled.refund.is_some(),
            "Sub-order cancelled by buyer"
        );
        self.publisher.publish(&DomainEvent::SubOrderCancelled { sub_order_id, order_id: sub.order_id }).await;
        self.publisher.publish(&DomainEvent::ShipmentStatusChanged {
            shipment_id: cancelled.shipment.id,
            sub_order_id,
            from: shipment.status,
            to: ShipmentStatus::Cancelled,
            carrier_status_code: cancelled.shipment.carrier_status_code,
        }).await;
        Ok(cancelled)
    }
}
