//! The ledger store: durable, transactional, row-versioned storage of stock
//! rows, reservations and history.
//!
//! The engine depends on this trait only. `PostgresLedgerStore` is the
//! production implementation; `InMemoryLedgerStore` honors the same
//! contracts for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    AppliedDelta, HistoryEntry, Reservation, ReservationStatus, StockDelta, StockRow,
};

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Latest committed row, no lock.
    async fn get_stock(&self, product_id: &str) -> Result<Option<StockRow>>;

    /// Batch read. The returned set may be smaller than the request and
    /// carries no ordering guarantee; callers re-index by `product_id`.
    async fn get_stocks(&self, product_ids: &[String]) -> Result<Vec<StockRow>>;

    /// Insert with version 1. Fails with `Conflict` if the product already
    /// has a row.
    async fn create_stock(&self, row: StockRow) -> Result<StockRow>;

    /// Conditional update on `(id, version)`; bumps the version and stamps
    /// `updated_at`. Fails with `VersionConflict` on an optimistic-lock miss.
    async fn update_stock(&self, row: &StockRow) -> Result<StockRow>;

    /// Single-row transaction: lock, apply the signed change with checked
    /// arithmetic, derive status, bump version, append history. Provisions a
    /// zero-stock row when the product is unknown.
    async fn adjust_quantity(&self, delta: &StockDelta, created_by: &str) -> Result<AppliedDelta>;

    /// One transaction inserting the reservation header and items, and
    /// conditionally incrementing each product's `reserved`. Rolls back
    /// entirely and fails with `Insufficient` on the first shortfall. Rows
    /// are locked in ascending `product_id` order.
    async fn create_reservation(&self, reservation: Reservation) -> Result<Reservation>;

    async fn get_reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>>;

    /// One transaction: flip the reservation `pending -> confirmed` (exactly
    /// one concurrent confirm/cancel wins), then per item decrement `on_hand`
    /// and `reserved` and append a `purchase` history entry written from the
    /// pre-image captured under the row lock.
    async fn confirm_reservation(
        &self,
        reservation_id: Uuid,
        order_id: &str,
    ) -> Result<Vec<AppliedDelta>>;

    /// One transaction: flip the reservation into `to_status` and release
    /// each item's hold. A product whose `reserved` is below the item
    /// quantity is skipped and reported back, not aborted.
    async fn release_reservation(
        &self,
        reservation_id: Uuid,
        to_status: ReservationStatus,
    ) -> Result<Vec<String>>;

    /// Pending reservations whose deadline has passed, oldest first.
    async fn list_expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>>;

    async fn append_history(&self, entry: HistoryEntry) -> Result<()>;

    /// Most-recent-first; limit clamped to [1, 1000].
    async fn read_history(
        &self,
        product_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>>;

    /// Records a bus request id. Returns true when this call claimed it,
    /// false when it was already processed.
    async fn claim_event(&self, request_id: &str) -> Result<bool>;

    /// Drops dedup marks older than the cutoff; returns how many.
    async fn purge_claimed_events(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Readiness probe.
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn clamp_history_limit(limit: i64) -> i64 {
    limit.clamp(1, 1000)
}
