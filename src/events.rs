//! Bus event contracts. Field names follow the platform's camelCase wire
//! convention; unknown fields are ignored on decode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{AppliedDelta, Reservation};

pub const EVENT_SOURCE: &str = "inventory-engine";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPurchased {
    pub request_id: String,
    pub order_id: String,
    pub user_id: String,
    pub items: Vec<PurchasedItem>,
    #[serde(default)]
    pub purchase_time: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub reply_topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasedItem {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default)]
    pub expected_inventory_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRestock {
    pub restock_id: String,
    pub items: Vec<RestockItem>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockItem {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAdjustment {
    pub adjustment_id: String,
    pub product_id: String,
    pub quantity_change: i32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub source: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUpdated {
    pub product_id: String,
    pub old_quantity: i32,
    pub new_quantity: i32,
    pub quantity_change: i32,
    pub old_status: String,
    pub new_status: String,
    pub operation_type: String,
    pub reference_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl InventoryUpdated {
    pub fn from_delta(delta: &AppliedDelta) -> Self {
        Self {
            product_id: delta.product_id.clone(),
            old_quantity: delta.old_quantity,
            new_quantity: delta.new_quantity,
            quantity_change: delta.change,
            old_status: delta.old_status.to_string(),
            new_status: delta.new_status.to_string(),
            operation_type: delta.operation.to_string(),
            reference_id: delta.reference_id.clone(),
            reason: delta.reason.clone(),
            timestamp: Utc::now(),
            source: EVENT_SOURCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserved {
    pub reservation_id: Uuid,
    pub user_id: String,
    pub items: Vec<ReservedItem>,
    pub expires_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedItem {
    pub product_id: String,
    pub quantity: i32,
}

impl InventoryReserved {
    pub fn from_reservation(reservation: &Reservation) -> Self {
        Self {
            reservation_id: reservation.id,
            user_id: reservation.user_id.clone(),
            items: reservation
                .items
                .iter()
                .map(|item| ReservedItem {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                })
                .collect(),
            expires_at: reservation.expires_at,
            timestamp: Utc::now(),
            source: EVENT_SOURCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryConfirmed {
    pub reservation_id: Uuid,
    pub order_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedItem {
    pub product_id: String,
    pub requested_qty: i32,
    pub processed_qty: i32,
    pub old_quantity: i32,
    pub new_quantity: i32,
    pub old_status: String,
    pub new_status: String,
    pub operation_type: String,
    pub reference_id: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub product_id: String,
    pub quantity: i32,
    pub error: String,
}

/// Completion envelope for a `ProductPurchased` event. The event is always
/// acknowledged; per-item outcomes land here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseConfirmation {
    pub request_id: String,
    pub order_id: String,
    pub user_id: String,
    pub processed_items: Vec<ProcessedItem>,
    pub failed_items: Vec<FailedItem>,
    pub total_items: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    pub success: bool,
    pub processed_at: DateTime<Utc>,
    pub source: String,
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Outbound publishing seam. The engine publishes after commits and treats
/// failures as observable-only: the committed ledger change stands.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_updated(&self, event: &InventoryUpdated) -> Result<()>;
    async fn publish_reserved(&self, event: &InventoryReserved) -> Result<()>;
    async fn publish_confirmed(&self, event: &InventoryConfirmed) -> Result<()>;
}

/// Sink that drops everything; used when the bus is disabled and in tests
/// that do not assert on published events.
#[derive(Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish_updated(&self, _event: &InventoryUpdated) -> Result<()> {
        Ok(())
    }

    async fn publish_reserved(&self, _event: &InventoryReserved) -> Result<()> {
        Ok(())
    }

    async fn publish_confirmed(&self, _event: &InventoryConfirmed) -> Result<()> {
        Ok(())
    }
}
