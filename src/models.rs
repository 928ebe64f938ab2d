//! Domain model: stock rows, reservations, history entries and the pure
//! state transitions over them. No I/O lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{InventoryError, Result};

/// Stock row status, derived from availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Available,
    OutOfStock,
    Upcoming,
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StockStatus::Available => "available",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Upcoming => "upcoming",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Ledger mutation kinds recorded in history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Purchase,
    Restock,
    Adjustment,
    Return,
    Reserve,
    Release,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Purchase => "purchase",
            Operation::Restock => "restock",
            Operation::Adjustment => "adjustment",
            Operation::Return => "return",
            Operation::Reserve => "reserve",
            Operation::Release => "release",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Operation {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "purchase" => Ok(Operation::Purchase),
            "restock" => Ok(Operation::Restock),
            "adjustment" => Ok(Operation::Adjustment),
            "return" => Ok(Operation::Return),
            "reserve" => Ok(Operation::Reserve),
            "release" => Ok(Operation::Release),
            other => Err(InventoryError::Validation(format!(
                "unknown operation type: {}",
                other
            ))),
        }
    }
}

/// The canonical per-product record. `available` is persisted for query
/// convenience but recomputed from `on_hand - reserved` on every write.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StockRow {
    pub id: Uuid,
    pub product_id: String,
    pub on_hand: i32,
    pub reserved: i32,
    pub available: i32,
    pub status: StockStatus,
    pub min_stock: i32,
    pub max_stock: i32,
    pub reorder_point: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl StockRow {
    pub fn available_of(&self) -> i32 {
        self.on_hand - self.reserved
    }

    pub fn can_reserve(&self, quantity: i32) -> bool {
        quantity > 0 && self.available_of() >= quantity
    }

    /// Recompute `available` and the derived status. Called on every
    /// mutation, so an `upcoming` row keeps its status until its first
    /// reservation or restock brings it into normal flow.
    pub fn update_status(&mut self) {
        self.available = self.available_of();
        self.status = if self.available <= 0 {
            StockStatus::OutOfStock
        } else {
            StockStatus::Available
        };
    }

    /// Zero-stock placeholder for batch checks against unknown products.
    /// Never persisted.
    pub fn synthetic(product_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::nil(),
            product_id: product_id.to_string(),
            on_hand: 0,
            reserved: 0,
            available: 0,
            status: StockStatus::OutOfStock,
            min_stock: 0,
            max_stock: 1000,
            reorder_point: 10,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// A time-bounded hold against one or more products. Items are immutable
/// after creation; the status leaves `pending` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: String,
    pub order_id: Option<String>,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub items: Vec<ReservationItem>,
}

impl Reservation {
    /// `expires_at` is exclusive: equal-to-now has expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn can_confirm(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && !self.is_expired(now)
    }

    pub fn can_cancel(&self) -> bool {
        self.status == ReservationStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReservationItem {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record for an on-hand mutation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub product_id: String,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub quantity_change: i32,
    pub operation_type: Operation,
    pub reference_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Catalog hint consumed by the smart-create policy. The catalog owns this
/// data; the engine only reads it at provisioning time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogHint {
    pub status: String,
}

/// A single product/quantity pair, shared by check-batch and reserve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRequest {
    pub product_id: String,
    pub quantity: i32,
}

/// One signed on-hand mutation request.
#[derive(Debug, Clone)]
pub struct StockDelta {
    pub product_id: String,
    pub change: i32,
    pub operation: Operation,
    pub reference_id: String,
    pub reason: String,
}

/// Committed outcome of a delta, carried back for outbound events.
#[derive(Debug, Clone)]
pub struct AppliedDelta {
    pub product_id: String,
    pub old_quantity: i32,
    pub new_quantity: i32,
    pub change: i32,
    pub old_status: StockStatus,
    pub new_status: StockStatus,
    pub operation: Operation,
    pub reference_id: String,
    pub reason: String,
}

/// Checked 32-bit arithmetic for quantity counters. Overflow is an error,
/// never wrap-around; a negative result is an underflow.
pub fn apply_change(product_id: &str, current: i32, change: i32) -> Result<i32> {
    let next = current
        .checked_add(change)
        .ok_or_else(|| InventoryError::Overflow {
            product_id: product_id.to_string(),
            current,
            change,
        })?;
    if next < 0 {
        return Err(InventoryError::Underflow {
            product_id: product_id.to_string(),
            current,
            change,
        });
    }
    Ok(next)
}
