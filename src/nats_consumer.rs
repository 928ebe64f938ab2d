//! Inbound event consumer.
//!
//! Messages arrive at-least-once; `ProductPurchased` events are deduplicated
//! by request id before dispatch. A poisonous item never stalls the stream:
//! per-item failures are captured in the confirmation envelope and the event
//! as a whole always completes.

use std::sync::Arc;

use async_nats::Client;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{NatsConfig, TopicsConfig};
use crate::context::RequestContext;
use crate::errors::{InventoryError, Result};
use crate::events::{
    FailedItem, InventoryAdjustment, InventoryRestock, ProcessedItem, ProductPurchased,
    PurchaseConfirmation, EVENT_SOURCE,
};
use crate::models::{Operation, StockDelta};
use crate::nats::EventProducer;
use crate::services::InventoryService;

const CONSUMER_ACTOR: &str = "bus-consumer";

/// Decodes inbound events into engine calls. Separate from the subscription
/// loop so it can be driven directly in tests.
pub struct InboundHandler {
    engine: Arc<InventoryService>,
}

impl InboundHandler {
    pub fn new(engine: Arc<InventoryService>) -> Self {
        Self { engine }
    }

    /// Deduct stock for every purchased item. Returns `None` when the event
    /// is a duplicate delivery, otherwise the confirmation envelope.
    pub async fn handle_product_purchased(
        &self,
        event: &ProductPurchased,
    ) -> Option<PurchaseConfirmation> {
        self.engine.metrics().events_consumed_total.inc();

        match self.engine.claim_event(&event.request_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.engine.metrics().events_deduplicated_total.inc();
                info!(
                    request_id = %event.request_id,
                    order_id = %event.order_id,
                    "duplicate purchase event dropped"
                );
                return None;
            }
            // Better to risk a double-apply than to drop the purchase; the
            // per-item failures below still surface anything that goes wrong.
            Err(err) => {
                error!(request_id = %event.request_id, error = %err, "dedup claim failed, processing anyway");
            }
        }

        info!(
            request_id = %event.request_id,
            order_id = %event.order_id,
            user_id = %event.user_id,
            items = event.items.len(),
            "processing purchase event"
        );

        let ctx = RequestContext::system(CONSUMER_ACTOR);
        let mut processed_items = Vec::new();
        let mut failed_items = Vec::new();

        for item in &event.items {
            let hint = crate::models::CatalogHint {
                status: item.expected_inventory_status.clone(),
            };

            // Provisions first-seen products before the deduction.
            if let Err(err) = self.engine.check(&ctx, &item.product_id, 1, Some(&hint)).await {
                failed_items.push(FailedItem {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    error: err.to_string(),
                });
                continue;
            }

            let delta = StockDelta {
                product_id: item.product_id.clone(),
                change: -item.quantity,
                operation: Operation::Purchase,
                reference_id: event.order_id.clone(),
                reason: "product purchased".to_string(),
            };

            match self.engine.update_inventory(&ctx, &[delta]).await.remove(0) {
                Ok(applied) => processed_items.push(ProcessedItem {
                    product_id: item.product_id.clone(),
                    requested_qty: item.quantity,
                    processed_qty: item.quantity,
                    old_quantity: applied.old_quantity,
                    new_quantity: applied.new_quantity,
                    old_status: applied.old_status.to_string(),
                    new_status: applied.new_status.to_string(),
                    operation_type: applied.operation.to_string(),
                    reference_id: event.order_id.clone(),
                    processed_at: Utc::now(),
                }),
                Err(err) => {
                    error!(
                        product_id = %item.product_id,
                        quantity = item.quantity,
                        error = %err,
                        "failed to apply purchase deduction"
                    );
                    failed_items.push(FailedItem {
                        product_id: item.product_id.clone(),
                        quantity: item.quantity,
                        error: err.to_string(),
                    });
                }
            }
        }

        let confirmation = PurchaseConfirmation {
            request_id: event.request_id.clone(),
            order_id: event.order_id.clone(),
            user_id: event.user_id.clone(),
            total_items: event.items.len(),
            processed_count: processed_items.len(),
            failed_count: failed_items.len(),
            success: failed_items.is_empty(),
            processed_items,
            failed_items,
            processed_at: Utc::now(),
            source: EVENT_SOURCE.to_string(),
        };

        info!(
            request_id = %event.request_id,
            processed = confirmation.processed_count,
            failed = confirmation.failed_count,
            success = confirmation.success,
            "purchase event completed"
        );
        Some(confirmation)
    }

    pub async fn handle_restock(&self, event: &InventoryRestock) {
        self.engine.metrics().events_consumed_total.inc();
        info!(
            restock_id = %event.restock_id,
            items = event.items.len(),
            reason = %event.reason,
            "processing restock event"
        );

        let actor = if event.created_by.is_empty() {
            CONSUMER_ACTOR
        } else {
            event.created_by.as_str()
        };
        let ctx = RequestContext::system(actor);

        for item in &event.items {
            let delta = StockDelta {
                product_id: item.product_id.clone(),
                change: item.quantity,
                operation: Operation::Restock,
                reference_id: event.restock_id.clone(),
                reason: event.reason.clone(),
            };
            if let Err(err) = self.engine.update_inventory(&ctx, &[delta]).await.remove(0) {
                error!(
                    product_id = %item.product_id,
                    quantity = item.quantity,
                    error = %err,
                    "failed to apply restock"
                );
            }
        }
    }

    pub async fn handle_adjustment(&self, event: &InventoryAdjustment) {
        self.engine.metrics().events_consumed_total.inc();
        info!(
            adjustment_id = %event.adjustment_id,
            product_id = %event.product_id,
            quantity_change = event.quantity_change,
            "processing adjustment event"
        );

        let actor = if event.created_by.is_empty() {
            CONSUMER_ACTOR
        } else {
            event.created_by.as_str()
        };
        let ctx = RequestContext::system(actor);

        let delta = StockDelta {
            product_id: event.product_id.clone(),
            change: event.quantity_change,
            operation: Operation::Adjustment,
            reference_id: event.adjustment_id.clone(),
            reason: event.reason.clone(),
        };
        if let Err(err) = self.engine.update_inventory(&ctx, &[delta]).await.remove(0) {
            error!(
                product_id = %event.product_id,
                quantity_change = event.quantity_change,
                error = %err,
                "failed to apply adjustment"
            );
        }
    }
}

pub struct EventConsumer {
    client: Client,
    handler: InboundHandler,
    producer: Arc<EventProducer>,
    topics: TopicsConfig,
    queue_group: String,
}

impl EventConsumer {
    pub async fn connect(
        cfg: &NatsConfig,
        engine: Arc<InventoryService>,
        producer: Arc<EventProducer>,
    ) -> Result<Self> {
        let client = async_nats::connect(&cfg.url)
            .await
            .map_err(|e| InventoryError::Bus(e.to_string()))?;

        info!(url = %cfg.url, queue_group = %cfg.queue_group, "consumer connected to NATS");

        Ok(Self {
            client,
            handler: InboundHandler::new(engine),
            producer,
            topics: cfg.topics.clone(),
            queue_group: cfg.queue_group.clone(),
        })
    }

    /// Consume until the stream closes or shutdown is signalled. Bad payloads
    /// are logged and dropped so one malformed message cannot wedge the
    /// subject.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut purchased = self
            .client
            .queue_subscribe(self.topics.product_purchased.clone(), self.queue_group.clone())
            .await?;
        let mut restock = self
            .client
            .queue_subscribe(self.topics.inventory_restock.clone(), self.queue_group.clone())
            .await?;
        let mut adjustment = self
            .client
            .queue_subscribe(
                self.topics.inventory_adjustment.clone(),
                self.queue_group.clone(),
            )
            .await?;

        info!(
            purchased = %self.topics.product_purchased,
            restock = %self.topics.inventory_restock,
            adjustment = %self.topics.inventory_adjustment,
            "event consumer started"
        );

        loop {
            tokio::select! {
                Some(msg) = purchased.next() => {
                    match serde_json::from_slice::<ProductPurchased>(&msg.payload) {
                        Ok(event) => self.on_purchased(event).await,
                        Err(err) => warn!(error = %err, "failed to decode purchase event"),
                    }
                }
                Some(msg) = restock.next() => {
                    match serde_json::from_slice::<InventoryRestock>(&msg.payload) {
                        Ok(event) => self.handler.handle_restock(&event).await,
                        Err(err) => warn!(error = %err, "failed to decode restock event"),
                    }
                }
                Some(msg) = adjustment.next() => {
                    match serde_json::from_slice::<InventoryAdjustment>(&msg.payload) {
                        Ok(event) => self.handler.handle_adjustment(&event).await,
                        Err(err) => warn!(error = %err, "failed to decode adjustment event"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }

        info!("event consumer stopped");
        Ok(())
    }

    async fn on_purchased(&self, event: ProductPurchased) {
        let reply_topic = event.reply_topic.clone();

        let Some(confirmation) = self.handler.handle_product_purchased(&event).await else {
            return;
        };

        if let Some(reply_topic) = reply_topic.filter(|t| !t.is_empty()) {
            if let Err(err) = self
                .producer
                .publish_purchase_confirmation(&reply_topic, &confirmation)
                .await
            {
                self.handler.engine.metrics().publish_failures_total.inc();
                error!(
                    reply_topic = %reply_topic,
                    request_id = %confirmation.request_id,
                    error = %err,
                    "failed to publish purchase confirmation"
                );
            }
        }
    }
}
