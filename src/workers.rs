//! Background loops: expired voucher holds and carrier status polling.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use crate::services::{ShipmentService, VoucherService};

const POLL_BATCH: i64 = 200;

/// Release voucher reservations whose hold has lapsed.
pub fn spawn_reservation_sweeper(vouchers: VoucherService, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "Reservation sweeper started");
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match vouchers.expire_due(Utc::now()).await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "Expired voucher reservations"),
                Err(e) => error!("❌ Failed to expire reservations: {e:?}"),
            }
        }
        info!("Reservation sweeper stopped");
    })
}

/// Retry failed bookings, then pull status for parcels the webhook may have missed.
pub fn spawn_shipment_poller(shipments: ShipmentService, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "Shipment poller started");
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip immediate tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match shipments.retry_bookings(POLL_BATCH).await {
                Ok(report) if report.checked > 0 => info!(checked = report.checked, booked = report.changed, failed = report.failed, "Carrier booking retry"),
                Ok(_) => {}
                Err(e) => error!("❌ Failed to retry carrier bookings: {e:?}"),
            }
            match shipments.sync_in_flight(POLL_BATCH).await {
                Ok(report) if report.checked > 0 => info!(checked = report.checked, changed = report.changed, failed = report.failed, "Shipment status poll"),
                Ok(_) => {}
                Err(e) => error!("❌ Failed to poll shipment statuses: {e:?}"),
            }
        }
        info!("Shipment poller stopped");
    })
}
