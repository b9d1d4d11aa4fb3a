//! Domain event publishing over NATS.
//!
//! Events go out after the state change has committed. A failed publish is logged
//! and dropped; it never undoes the change.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};
use crate::domain::events::DomainEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent);
}

pub type DynPublisher = Arc<dyn EventPublisher>;

pub struct NatsPublisher { client: async_nats::Client }

impl NatsPublisher {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(&self, event: &DomainEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("❌ Failed to serialise {} event: {e:?}", event.kind());
                return;
            }
        };
        if let Err(e) = self.client.publish(event.subject(), payload.into()).await {
            error!(subject = %event.subject(), "❌ Failed to publish event: {e:?}");
        }
    }
}

/// Used when no NATS server is configured.
#[derive(Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &DomainEvent) {
        info!(subject = %event.subject(), event = ?event, "domain event");
    }
}
