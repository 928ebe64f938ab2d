//! In-memory ledger store. One mutex serializes every operation, which makes
//! each call atomic in the same sense as the Postgres transactions; version
//! checks and status CAS semantics are still enforced so engine behavior is
//! identical under test.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{InventoryError, Result};
use crate::models::{
    apply_change, AppliedDelta, HistoryEntry, Operation, Reservation, ReservationStatus,
    StockDelta, StockRow, StockStatus,
};
use crate::store::{clamp_history_limit, LedgerStore};

#[derive(Default)]
struct Inner {
    stocks: HashMap<String, StockRow>,
    reservations: HashMap<Uuid, Reservation>,
    history: Vec<HistoryEntry>,
    processed: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn provision_zero_row(product_id: &str) -> StockRow {
        let now = Utc::now();
        StockRow {
            id: Uuid::new_v4(),
            product_id: product_id.to_string(),
            on_hand: 0,
            reserved: 0,
            available: 0,
            status: StockStatus::OutOfStock,
            min_stock: 10,
            max_stock: 1000,
            reorder_point: 20,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_stock(&self, product_id: &str) -> Result<Option<StockRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.stocks.get(product_id).cloned())
    }

    async fn get_stocks(&self, product_ids: &[String]) -> Result<Vec<StockRow>> {
        let inner = self.inner.lock().await;
        Ok(product_ids
            .iter()
            .filter_map(|id| inner.stocks.get(id).cloned())
            .collect())
    }

    async fn create_stock(&self, mut row: StockRow) -> Result<StockRow> {
        let mut inner = self.inner.lock().await;
        if inner.stocks.contains_key(&row.product_id) {
            return Err(InventoryError::Conflict(row.product_id));
        }
        row.version = 1;
        row.available = row.available_of();
        inner.stocks.insert(row.product_id.clone(), row.clone());
        Ok(row)
    }

    async fn update_stock(&self, row: &StockRow) -> Result<StockRow> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .stocks
            .get_mut(&row.product_id)
            .ok_or_else(|| InventoryError::VersionConflict(row.product_id.clone()))?;
        if stored.version != row.version {
            return Err(InventoryError::VersionConflict(row.product_id.clone()));
        }
        let mut next = row.clone();
        next.version = stored.version + 1;
        next.updated_at = Utc::now();
        next.update_status();
        *stored = next.clone();
        Ok(next)
    }

    async fn adjust_quantity(&self, delta: &StockDelta, created_by: &str) -> Result<AppliedDelta> {
        let mut inner = self.inner.lock().await;
        // Nothing is persisted (including a provisioned row) unless the
        // adjustment itself goes through, mirroring the transactional store.
        let mut row = inner
            .stocks
            .get(&delta.product_id)
            .cloned()
            .unwrap_or_else(|| Self::provision_zero_row(&delta.product_id));

        let old_quantity = row.on_hand;
        let old_status = row.status;
        let new_quantity = apply_change(&delta.product_id, old_quantity, delta.change)?;
        // A deduction may not eat into stock held by pending reservations.
        if new_quantity < row.reserved {
            return Err(InventoryError::Underflow {
                product_id: delta.product_id.clone(),
                current: old_quantity,
                change: delta.change,
            });
        }

        row.on_hand = new_quantity;
        row.update_status();
        row.updated_at = Utc::now();
        row.version += 1;
        let new_status = row.status;
        inner.stocks.insert(delta.product_id.clone(), row);

        inner.history.push(HistoryEntry {
            id: Uuid::new_v4(),
            product_id: delta.product_id.clone(),
            quantity_before: old_quantity,
            quantity_after: new_quantity,
            quantity_change: delta.change,
            operation_type: delta.operation,
            reference_id: delta.reference_id.clone(),
            reason: delta.reason.clone(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
        });

        Ok(AppliedDelta {
            product_id: delta.product_id.clone(),
            old_quantity,
            new_quantity,
            change: delta.change,
            old_status,
            new_status,
            operation: delta.operation,
            reference_id: delta.reference_id.clone(),
            reason: delta.reason.clone(),
        })
    }

    async fn create_reservation(&self, mut reservation: Reservation) -> Result<Reservation> {
        let mut inner = self.inner.lock().await;

        let mut items = reservation.items.clone();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));

        // All-or-nothing: verify every item before touching any counter.
        for item in &items {
            let available = inner
                .stocks
                .get(&item.product_id)
                .map(|row| row.available_of())
                .unwrap_or(0);
            if available < item.quantity {
                return Err(InventoryError::Insufficient {
                    product_id: item.product_id.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }

        for item in &items {
            let row = inner
                .stocks
                .get_mut(&item.product_id)
                .expect("verified above");
            row.reserved += item.quantity;
            row.update_status();
            row.updated_at = Utc::now();
            row.version += 1;
        }

        let now = Utc::now();
        reservation.created_at = now;
        reservation.updated_at = now;
        inner
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        let inner = self.inner.lock().await;
        Ok(inner.reservations.get(&reservation_id).cloned())
    }

    async fn confirm_reservation(
        &self,
        reservation_id: Uuid,
        order_id: &str,
    ) -> Result<Vec<AppliedDelta>> {
        let mut inner = self.inner.lock().await;

        let reservation = inner
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(InventoryError::NotFound(reservation_id))?;
        if reservation.status != ReservationStatus::Pending {
            return Err(InventoryError::BadState {
                id: reservation_id,
                status: reservation.status,
            });
        }

        let mut items = reservation.items.clone();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));

        for item in &items {
            let reserved = inner
                .stocks
                .get(&item.product_id)
                .map(|row| row.reserved)
                .unwrap_or(0);
            if reserved < item.quantity {
                return Err(InventoryError::Insufficient {
                    product_id: item.product_id.clone(),
                    requested: item.quantity,
                    available: reserved,
                });
            }
        }

        let mut deltas = Vec::with_capacity(items.len());
        for item in &items {
            let row = inner
                .stocks
                .get_mut(&item.product_id)
                .expect("verified above");
            let old_quantity = row.on_hand;
            let old_status = row.status;
            let new_quantity = apply_change(&item.product_id, old_quantity, -item.quantity)?;

            row.on_hand = new_quantity;
            row.reserved -= item.quantity;
            row.update_status();
            row.updated_at = Utc::now();
            row.version += 1;
            let new_status = row.status;

            inner.history.push(HistoryEntry {
                id: Uuid::new_v4(),
                product_id: item.product_id.clone(),
                quantity_before: old_quantity,
                quantity_after: new_quantity,
                quantity_change: -item.quantity,
                operation_type: Operation::Purchase,
                reference_id: order_id.to_string(),
                reason: "order confirmation".to_string(),
                created_at: Utc::now(),
                created_by: "system".to_string(),
            });

            deltas.push(AppliedDelta {
                product_id: item.product_id.clone(),
                old_quantity,
                new_quantity,
                change: -item.quantity,
                old_status,
                new_status,
                operation: Operation::Purchase,
                reference_id: order_id.to_string(),
                reason: "order confirmation".to_string(),
            });
        }

        let stored = inner
            .reservations
            .get_mut(&reservation_id)
            .expect("loaded above");
        stored.status = ReservationStatus::Confirmed;
        stored.order_id = Some(order_id.to_string());
        stored.updated_at = Utc::now();

        Ok(deltas)
    }

    async fn release_reservation(
        &self,
        reservation_id: Uuid,
        to_status: ReservationStatus,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;

        let reservation = inner
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(InventoryError::NotFound(reservation_id))?;
        if reservation.status != ReservationStatus::Pending {
            return Err(InventoryError::BadState {
                id: reservation_id,
                status: reservation.status,
            });
        }

        let mut items = reservation.items.clone();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));

        let mut shortfalls = Vec::new();
        for item in &items {
            match inner.stocks.get_mut(&item.product_id) {
                Some(row) if row.reserved >= item.quantity => {
                    row.reserved -= item.quantity;
                    row.update_status();
                    row.updated_at = Utc::now();
                    row.version += 1;
                }
                _ => shortfalls.push(item.product_id.clone()),
            }
        }

        let stored = inner
            .reservations
            .get_mut(&reservation_id)
            .expect("loaded above");
        stored.status = to_status;
        stored.updated_at = Utc::now();

        Ok(shortfalls)
    }

    async fn list_expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<Reservation> = inner
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.history.push(entry);
        Ok(())
    }

    async fn read_history(
        &self,
        product_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let limit = clamp_history_limit(limit) as usize;
        let inner = self.inner.lock().await;
        // Appends are chronological, so reverse iteration is most-recent
        // first and stays deterministic under identical timestamps.
        let entries: Vec<HistoryEntry> = inner
            .history
            .iter()
            .rev()
            .filter(|e| e.product_id == product_id && e.created_at >= from && e.created_at <= to)
            .take(limit)
            .cloned()
            .collect();
        Ok(entries)
    }

    async fn claim_event(&self, request_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.processed.contains_key(request_id) {
            return Ok(false);
        }
        inner.processed.insert(request_id.to_string(), Utc::now());
        Ok(true)
    }

    async fn purge_claimed_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.processed.len();
        inner.processed.retain(|_, at| *at >= older_than);
        Ok((before - inner.processed.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
