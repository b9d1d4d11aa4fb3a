//! Carrier bookings and status synchronisation (webhook and polling).

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use crate::carrier::{DynCarrier, ParcelRequest};
use crate::domain::aggregates::{CarrierUpdate, Shipment, ShipmentUpdateOutcome};
use crate::domain::events::DomainEvent;
use crate::messaging::DynPublisher;
use crate::store::{AppliedUpdate, DynStore};
use crate::{MarketplaceError, Result};

const CARRIER_CONCURRENCY: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ShipmentService {
    store: DynStore,
    carrier: DynCarrier,
    publisher: DynPublisher,
    webhook_token: Arc<str>,
}

impl ShipmentService {
    pub fn new(store: DynStore, carrier: DynCarrier, publisher: DynPublisher, webhook_token: impl Into<Arc<str>>) -> Self {
        Self { store, carrier, publisher, webhook_token: webhook_token.into() }
    }

    /// Constant-time comparison against the configured webhook token.
    pub fn verify_webhook_token(&self, given: &str) -> bool {
        let expected = self.webhook_token.as_bytes();
        let given = given.as_bytes();
        expected.len() == given.len() && expected.iter().zip(given).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }

    /// Book the parcel with the carrier. Failures are recorded on the shipment and left
    /// for the retry worker.
    pub async fn dispatch(&self, shipment: &Shipment) -> Result<Shipment> {
        let request = ParcelRequest::for_shipment(shipment);
        let order = match self.carrier.create_order(&request).await {
            Ok(order) => order,
            Err(e) => {
                warn!(shipment_id = %shipment.id, carrier = self.carrier.name(), "Carrier booking failed: {e}");
                self.store.record_carrier_failure(shipment.id, &e.to_string(), Utc::now()).await?;
                return Err(e.into());
            }
        };
        match self.store.record_carrier_order(shipment.id, &order, Utc::now()).await {
            Ok(updated) => {
                info!(shipment_id = %shipment.id, label = %order.label, fee = order.fee.amount(), "📦 Carrier order created");
                self.publish_transition(&updated, shipment.status).await;
                Ok(updated)
            }
            Err(e) => {
                // The shipment moved on (e.g. the buyer cancelled) while we were booking.
                warn!(shipment_id = %shipment.id, label = %order.label, "Booked parcel could not be recorded, cancelling it: {e}");
                if let Err(cancel_err) = self.carrier.cancel_order(&order.label).await {
                    error!(label = %order.label, "❌ Failed to cancel orphaned parcel: {cancel_err}");
                }
                Err(e)
            }
        }
    }

    /// Apply a pushed update. Unknown labels are acknowledged with `None`.
    pub async fn apply_update(&self, update: &CarrierUpdate) -> Result<Option<AppliedUpdate>> {
        let Some(shipment) = self.store.shipment_by_label(&update.label).await? else {
            info!(label = %update.label, status_code = update.status_code, "Carrier update for unknown label");
            return Ok(None);
        };
        self.apply_to(&shipment, update).await.map(Some)
    }

    /// Poll the carrier for every shipment still on the road.
    pub async fn sync_in_flight(&self, limit: i64) -> Result<SyncReport> {
        let shipments = self.store.shipments_in_flight(limit).await?;
        let results: Vec<Result<bool>> = stream::iter(shipments)
            .map(|shipment| async move {
                let label = shipment.label.clone().ok_or(MarketplaceError::NotFound("label"))?;
                let update = self.carrier.fetch_status(&label).await?;
                let applied = self.apply_to(&shipment, &update).await?;
                Ok(matches!(applied.outcome, ShipmentUpdateOutcome::Applied { .. }))
            })
            .buffer_unordered(CARRIER_CONCURRENCY)
            .collect()
            .await;
        Ok(tally(results, "status sync"))
    }

    /// Retry bookings that failed at checkout.
    pub async fn retry_bookings(&self, limit: i64) -> Result<SyncReport> {
        let shipments = self.store.shipments_awaiting_carrier(limit).await?;
        let results: Vec<Result<bool>> = stream::iter(shipments)
            .map(|shipment| async move { self.dispatch(&shipment).await.map(|_| true) })
            .buffer_unordered(CARRIER_CONCURRENCY)
            .collect()
            .await;
        Ok(tally(results, "booking retry"))
    }

    async fn apply_to(&self, shipment: &Shipment, update: &CarrierUpdate) -> Result<AppliedUpdate> {
        let applied = self.store.apply_carrier_update(shipment.id, update, Utc::now()).await?;
        debug!(label = %update.label, status_code = update.status_code, outcome = applied.outcome.as_str(), "Carrier update processed");
        if let ShipmentUpdateOutcome::Applied { from, to } = applied.outcome {
            info!(shipment_id = %shipment.id, from = from.as_str(), to = to.as_str(), "🚚 Shipment status changed");
            self.publish_transition(&applied.shipment, from).await;
        }
        if let Some(payment) = &applied.payment_completed {
            info!(order_id = %payment.order_id, amount = payment.amount.amount(), "💰 COD collected");
            self.publisher.publish(&DomainEvent::PaymentCompleted { payment_id: payment.id, order_id: payment.order_id, amount: payment.amount }).await;
        }
        Ok(applied)
    }

    async fn publish_transition(&self, shipment: &Shipment, from: crate::domain::aggregates::ShipmentStatus) {
        self.publisher.publish(&DomainEvent::ShipmentStatusChanged {
            shipment_id: shipment.id,
            sub_order_id: shipment.sub_order_id,
            from,
            to: shipment.status,
            carrier_status_code: shipment.carrier_status_code,
        }).await;
    }
}

fn tally(results: Vec<Result<bool>>, task: &str) -> SyncReport {
    let mut report = SyncReport { checked: results.len(), ..SyncReport::default() };
    for result in results {
        match result {
            Ok(true) => report.changed += 1,
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                warn!(task, "Shipment {task} failed: {e}");
            }
        }
    }
    report
}
