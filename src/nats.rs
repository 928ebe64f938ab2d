//! Outbound event producer.
//!
//! Events are published to `"<topic>.<key>"` subjects so downstream
//! consumers observe per-key FIFO: stock updates are keyed by product id,
//! reservation events by reservation id.

use async_nats::Client;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TopicsConfig;
use crate::errors::{InventoryError, Result};
use crate::events::{
    EventSink, InventoryConfirmed, InventoryReserved, InventoryUpdated, PurchaseConfirmation,
};

pub struct EventProducer {
    client: Client,
    topics: TopicsConfig,
}

impl EventProducer {
    pub async fn connect(url: &str, topics: TopicsConfig) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| InventoryError::Bus(e.to_string()))?;

        info!(url = %url, "connected to NATS");
        Ok(Self { client, topics })
    }

    pub fn with_client(client: Client, topics: TopicsConfig) -> Self {
        Self { client, topics }
    }

    async fn publish<T: Serialize>(&self, topic: &str, key: &str, payload: &T) -> Result<()> {
        let subject = format!("{}.{}", topic, key);
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|e| InventoryError::Bus(format!("publish to {} failed: {}", subject, e)))?;
        debug!(subject = %subject, "published event");
        Ok(())
    }

    /// Reply-subject confirmation for a purchase event; not keyed.
    pub async fn publish_purchase_confirmation(
        &self,
        reply_topic: &str,
        confirmation: &PurchaseConfirmation,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(confirmation)?;
        self.client
            .publish(reply_topic.to_string(), bytes.into())
            .await
            .map_err(|e| {
                InventoryError::Bus(format!("publish to {} failed: {}", reply_topic, e))
            })?;
        info!(
            reply_topic = %reply_topic,
            request_id = %confirmation.request_id,
            success = confirmation.success,
            "published purchase confirmation"
        );
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| InventoryError::Bus(e.to_string()))
    }
}

#[async_trait]
impl EventSink for EventProducer {
    async fn publish_updated(&self, event: &InventoryUpdated) -> Result<()> {
        self.publish(&self.topics.inventory_updated, &event.product_id, event)
            .await
    }

    async fn publish_reserved(&self, event: &InventoryReserved) -> Result<()> {
        self.publish(
            &self.topics.inventory_reserved,
            &event.reservation_id.to_string(),
            event,
        )
        .await
    }

    async fn publish_confirmed(&self, event: &InventoryConfirmed) -> Result<()> {
        self.publish(
            &self.topics.inventory_confirmed,
            &event.reservation_id.to_string(),
            event,
        )
        .await
    }
}
