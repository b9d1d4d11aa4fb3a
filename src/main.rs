//! Marketplace Lifecycle - order, payment, shipment and settlement service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use marketplace_lifecycle::api::{self, AppState};
use marketplace_lifecycle::carrier::{DynCarrier, GhtkCarrier, SandboxCarrier};
use marketplace_lifecycle::config::Config;
use marketplace_lifecycle::messaging::{DynPublisher, LogPublisher, NatsPublisher};
use marketplace_lifecycle::services::{Services, Settings};
use marketplace_lifecycle::store::{DynStore, MemoryStore, PgStore};
use marketplace_lifecycle::vnpay::VnpayGateway;
use marketplace_lifecycle::workers;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    let store: DynStore = match &config.database_url {
        Some(url) => {
            let db = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PgStore::new(db);
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let publisher: DynPublisher = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Arc::new(NatsPublisher::new(client)),
            Err(e) => {
                warn!("NATS unavailable ({e}), logging events instead");
                Arc::new(LogPublisher)
            }
        },
        None => Arc::new(LogPublisher),
    };

    let carrier: DynCarrier = match &config.ghtk_api_token {
        Some(token) => Arc::new(GhtkCarrier::new(config.ghtk_base_url.clone(), token.clone())?),
        None => {
            warn!("GHTK_API_TOKEN not set, using the sandbox carrier");
            Arc::new(SandboxCarrier::new())
        }
    };

    let gateway = VnpayGateway::new(
        config.vnpay_tmn_code.clone(),
        config.vnpay_hash_secret.clone(),
        config.vnpay_pay_url.clone(),
        config.vnpay_return_url.clone(),
    );
    let settings = Settings {
        reservation_ttl: chrono::Duration::from_std(config.voucher_reservation_ttl)?,
        commission_rate: config.platform_commission_rate,
        ghtk_webhook_token: config.ghtk_webhook_token.clone(),
    };
    let services = Services::new(store, carrier, publisher, gateway, settings);

    let shutdown = CancellationToken::new();
    let sweeper = workers::spawn_reservation_sweeper(services.vouchers.clone(), config.reservation_sweep_interval, shutdown.clone());
    let poller = workers::spawn_shipment_poller(services.shipments.clone(), config.shipment_poll_interval, shutdown.clone());

    let app = api::router(AppState { services });
    info!(environment = %config.environment, "🚀 Marketplace lifecycle listening on 0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.ok(); })
        .await?;

    info!("Shutting down background workers");
    shutdown.cancel();
    let _ = tokio::join!(sweeper, poller);
    Ok(())
}
