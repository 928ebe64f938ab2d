#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use inventory_engine::config::ProvisionConfig;
use inventory_engine::errors::Result;
use inventory_engine::events::{EventSink, InventoryConfirmed, InventoryReserved, InventoryUpdated};
use inventory_engine::metrics::Metrics;
use inventory_engine::models::{StockRow, StockStatus};
use inventory_engine::services::InventoryService;
use inventory_engine::store::InMemoryLedgerStore;

/// Sink that records every published event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub updated: Mutex<Vec<InventoryUpdated>>,
    pub reserved: Mutex<Vec<InventoryReserved>>,
    pub confirmed: Mutex<Vec<InventoryConfirmed>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish_updated(&self, event: &InventoryUpdated) -> Result<()> {
        self.updated.lock().await.push(event.clone());
        Ok(())
    }

    async fn publish_reserved(&self, event: &InventoryReserved) -> Result<()> {
        self.reserved.lock().await.push(event.clone());
        Ok(())
    }

    async fn publish_confirmed(&self, event: &InventoryConfirmed) -> Result<()> {
        self.confirmed.lock().await.push(event.clone());
        Ok(())
    }
}

pub fn provision_defaults() -> ProvisionConfig {
    ProvisionConfig {
        available_stock: 100,
        upcoming_stock: 50,
        min_stock: 10,
        max_stock: 1000,
        reorder_point: 20,
    }
}

pub fn new_engine() -> (
    Arc<InventoryService>,
    Arc<InMemoryLedgerStore>,
    Arc<RecordingSink>,
) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let sink = Arc::new(RecordingSink::default());
    let engine = Arc::new(InventoryService::new(
        store.clone(),
        sink.clone(),
        provision_defaults(),
        15,
        Metrics::new().unwrap(),
    ));
    (engine, store, sink)
}

/// A stock row with the given on-hand count, ready for `create_stock`.
pub fn stock_row(product_id: &str, on_hand: i32) -> StockRow {
    let now = Utc::now();
    StockRow {
        id: Uuid::new_v4(),
        product_id: product_id.to_string(),
        on_hand,
        reserved: 0,
        available: on_hand,
        status: if on_hand > 0 {
            StockStatus::Available
        } else {
            StockStatus::OutOfStock
        },
        min_stock: 10,
        max_stock: 1000,
        reorder_point: 20,
        created_at: now,
        updated_at: now,
        version: 1,
    }
}
