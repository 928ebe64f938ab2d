//! The reservation engine: orchestrates check / reserve / confirm / cancel /
//! adjust / history / sweep against the ledger store and publishes outbound
//! events after commits.
//!
//! The store's conditional updates are the authoritative admission control;
//! everything the engine checks up front is a fast-path rejection only.
//! `VersionConflict` is never retried here — it is surfaced so the caller
//! decides.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProvisionConfig;
use crate::context::RequestContext;
use crate::errors::{InventoryError, Result};
use crate::events::{EventSink, InventoryConfirmed, InventoryReserved, InventoryUpdated};
use crate::metrics::Metrics;
use crate::models::{
    AppliedDelta, CatalogHint, HistoryEntry, ItemRequest, Reservation, ReservationItem,
    ReservationStatus, StockDelta, StockRow, StockStatus,
};
use crate::store::LedgerStore;

const DEFAULT_HISTORY_LIMIT: i64 = 100;
const DEFAULT_HISTORY_WINDOW_DAYS: i64 = 30;

pub struct InventoryService {
    store: Arc<dyn LedgerStore>,
    events: Arc<dyn EventSink>,
    provision: ProvisionConfig,
    default_timeout_minutes: i64,
    metrics: Metrics,
}

impl InventoryService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        events: Arc<dyn EventSink>,
        provision: ProvisionConfig,
        default_timeout_minutes: i64,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            events,
            provision,
            default_timeout_minutes,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Readiness probe, delegated to the store.
    pub async fn ready(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Read the stock row for a product, provisioning one on first reference,
    /// and report whether `quantity` units could be reserved right now.
    pub async fn check(
        &self,
        ctx: &RequestContext,
        product_id: &str,
        quantity: i32,
        hint: Option<&CatalogHint>,
    ) -> Result<(StockRow, bool)> {
        ctx.check_deadline()?;
        if product_id.is_empty() {
            return Err(InventoryError::Validation(
                "product id is required".to_string(),
            ));
        }
        if quantity <= 0 {
            return Err(InventoryError::Validation(
                "quantity must be greater than 0".to_string(),
            ));
        }

        let row = match self.store.get_stock(product_id).await? {
            Some(row) => row,
            None => self.smart_create(ctx, product_id, hint).await?,
        };

        let available = row.can_reserve(quantity);
        debug!(
            product_id = %product_id,
            requested = quantity,
            available_quantity = row.available_of(),
            can_reserve = available,
            "inventory check"
        );
        Ok((row, available))
    }

    /// Read-only batch check. Unknown products produce a synthetic zero row
    /// and are not provisioned.
    pub async fn check_batch(
        &self,
        ctx: &RequestContext,
        items: &[ItemRequest],
    ) -> Result<Vec<(StockRow, bool)>> {
        ctx.check_deadline()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        for item in items {
            if item.product_id.is_empty() || item.quantity <= 0 {
                return Err(InventoryError::Validation(format!(
                    "invalid item: product_id={:?}, quantity={}",
                    item.product_id, item.quantity
                )));
            }
        }

        let product_ids: Vec<String> = items.iter().map(|i| i.product_id.clone()).collect();
        let rows = self.store.get_stocks(&product_ids).await?;

        // The store does not guarantee order or completeness; re-index.
        let by_product: std::collections::HashMap<String, StockRow> = rows
            .into_iter()
            .map(|row| (row.product_id.clone(), row))
            .collect();

        Ok(items
            .iter()
            .map(|item| match by_product.get(&item.product_id) {
                Some(row) => (row.clone(), row.can_reserve(item.quantity)),
                None => (StockRow::synthetic(&item.product_id), false),
            })
            .collect())
    }

    /// Create a pending reservation holding every requested item, or fail
    /// atomically with the first shortfall.
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        items: &[ItemRequest],
        timeout_minutes: i64,
    ) -> Result<Reservation> {
        ctx.check_deadline()?;
        if user_id.is_empty() {
            return Err(InventoryError::Validation("user id is required".to_string()));
        }
        if items.is_empty() {
            return Err(InventoryError::Validation(
                "at least one item is required".to_string(),
            ));
        }
        for item in items {
            if item.product_id.is_empty() || item.quantity <= 0 {
                return Err(InventoryError::Validation(format!(
                    "invalid item: product_id={:?}, quantity={}",
                    item.product_id, item.quantity
                )));
            }
        }
        let timeout_minutes = if timeout_minutes <= 0 {
            self.default_timeout_minutes
        } else {
            timeout_minutes
        };

        // Fast-path rejection; provisions first-seen products. The ledger's
        // conditional update below remains authoritative.
        for item in items {
            let (row, available) = self.check(ctx, &item.product_id, item.quantity, None).await?;
            if !available {
                return Err(InventoryError::Insufficient {
                    product_id: item.product_id.clone(),
                    requested: item.quantity,
                    available: row.available_of(),
                });
            }
        }

        let reservation_id = Uuid::new_v4();
        let now = Utc::now();
        let reservation = Reservation {
            id: reservation_id,
            user_id: user_id.to_string(),
            order_id: None,
            status: ReservationStatus::Pending,
            expires_at: now + Duration::minutes(timeout_minutes),
            created_at: now,
            updated_at: now,
            items: items
                .iter()
                .map(|item| ReservationItem {
                    id: Uuid::new_v4(),
                    reservation_id,
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    created_at: now,
                })
                .collect(),
        };

        ctx.check_deadline()?;
        let reservation = self
            .store
            .create_reservation(reservation)
            .await
            .inspect_err(|err| self.note_error(err))?;

        self.metrics.reservations_created_total.inc();
        info!(
            reservation_id = %reservation.id,
            user_id = %user_id,
            items = reservation.items.len(),
            expires_at = %reservation.expires_at,
            "reserved inventory"
        );

        let event = InventoryReserved::from_reservation(&reservation);
        if let Err(err) = self.events.publish_reserved(&event).await {
            self.metrics.publish_failures_total.inc();
            error!(reservation_id = %reservation.id, error = %err, "failed to publish reserved event");
        }

        Ok(reservation)
    }

    pub async fn get_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: Uuid,
    ) -> Result<Reservation> {
        ctx.check_deadline()?;
        self.store
            .get_reservation(reservation_id)
            .await?
            .ok_or(InventoryError::NotFound(reservation_id))
    }

    /// Convert a pending hold into a committed purchase.
    pub async fn confirm(
        &self,
        ctx: &RequestContext,
        reservation_id: Uuid,
        order_id: &str,
    ) -> Result<()> {
        ctx.check_deadline()?;
        if order_id.is_empty() {
            return Err(InventoryError::Validation("order id is required".to_string()));
        }

        let reservation = self.get_reservation(ctx, reservation_id).await?;
        let now = Utc::now();
        if reservation.status.is_terminal() {
            return Err(InventoryError::BadState {
                id: reservation_id,
                status: reservation.status,
            });
        }
        if reservation.is_expired(now) {
            return Err(InventoryError::Expired(reservation_id));
        }

        ctx.check_deadline()?;
        let deltas = self
            .store
            .confirm_reservation(reservation_id, order_id)
            .await
            .inspect_err(|err| self.note_error(err))?;

        self.metrics.reservations_confirmed_total.inc();
        self.metrics.mutations_total.inc_by(deltas.len() as u64);
        info!(
            reservation_id = %reservation_id,
            order_id = %order_id,
            user_id = %reservation.user_id,
            items = deltas.len(),
            "confirmed reservation"
        );

        let confirmed = InventoryConfirmed {
            reservation_id,
            order_id: order_id.to_string(),
            user_id: reservation.user_id.clone(),
            timestamp: Utc::now(),
            source: crate::events::EVENT_SOURCE.to_string(),
        };
        if let Err(err) = self.events.publish_confirmed(&confirmed).await {
            self.metrics.publish_failures_total.inc();
            error!(reservation_id = %reservation_id, error = %err, "failed to publish confirmed event");
        }
        for delta in &deltas {
            self.emit_updated(delta).await;
        }

        Ok(())
    }

    /// Release a pending hold back to the pool.
    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<()> {
        ctx.check_deadline()?;

        let reservation = self.get_reservation(ctx, reservation_id).await?;
        if !reservation.can_cancel() {
            return Err(InventoryError::BadState {
                id: reservation_id,
                status: reservation.status,
            });
        }

        ctx.check_deadline()?;
        let shortfalls = self
            .store
            .release_reservation(reservation_id, ReservationStatus::Cancelled)
            .await
            .inspect_err(|err| self.note_error(err))?;
        self.note_shortfalls(reservation_id, &shortfalls);

        self.metrics.reservations_cancelled_total.inc();
        info!(
            reservation_id = %reservation_id,
            reason = %reason,
            user_id = %reservation.user_id,
            "cancelled reservation"
        );
        Ok(())
    }

    /// Apply a batch of signed deltas. Each delta is an independent
    /// transaction; outcomes are reported per delta and a failure never
    /// aborts the rest of the batch.
    pub async fn update_inventory(
        &self,
        ctx: &RequestContext,
        deltas: &[StockDelta],
    ) -> Vec<Result<AppliedDelta>> {
        let mut outcomes = Vec::with_capacity(deltas.len());
        for delta in deltas {
            outcomes.push(self.apply_delta(ctx, delta).await);
        }
        outcomes
    }

    async fn apply_delta(&self, ctx: &RequestContext, delta: &StockDelta) -> Result<AppliedDelta> {
        ctx.check_deadline()?;
        if delta.product_id.is_empty() {
            return Err(InventoryError::Validation(
                "product id is required".to_string(),
            ));
        }
        if delta.change == 0 {
            return Err(InventoryError::Validation(
                "quantity change cannot be zero".to_string(),
            ));
        }

        let applied = self
            .store
            .adjust_quantity(delta, &ctx.actor)
            .await
            .inspect_err(|err| self.note_error(err))?;

        self.metrics.mutations_total.inc();
        info!(
            product_id = %applied.product_id,
            old_quantity = applied.old_quantity,
            new_quantity = applied.new_quantity,
            change = applied.change,
            operation = %applied.operation,
            reference_id = %applied.reference_id,
            "updated inventory"
        );

        self.emit_updated(&applied).await;
        Ok(applied)
    }

    pub async fn history(
        &self,
        ctx: &RequestContext,
        product_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<HistoryEntry>> {
        ctx.check_deadline()?;
        if product_id.is_empty() {
            return Err(InventoryError::Validation(
                "product id is required".to_string(),
            ));
        }

        let to = to.unwrap_or_else(Utc::now);
        let from = from.unwrap_or_else(|| to - Duration::days(DEFAULT_HISTORY_WINDOW_DAYS));
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);

        self.store.read_history(product_id, from, to, limit).await
    }

    /// Expire every past-deadline pending reservation. Individual failures
    /// are logged and do not abort the sweep; returns the number expired.
    pub async fn sweep_expired(&self, ctx: &RequestContext) -> Result<usize> {
        ctx.check_deadline()?;
        let expired = self.store.list_expired_reservations(Utc::now()).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut swept = 0;
        for reservation in expired {
            match self
                .store
                .release_reservation(reservation.id, ReservationStatus::Expired)
                .await
            {
                Ok(shortfalls) => {
                    self.note_shortfalls(reservation.id, &shortfalls);
                    self.metrics.reservations_expired_total.inc();
                    swept += 1;
                    info!(
                        reservation_id = %reservation.id,
                        user_id = %reservation.user_id,
                        "expired reservation"
                    );
                }
                // A concurrent confirm/cancel already took the reservation
                // out of pending; nothing to release.
                Err(InventoryError::BadState { id, status }) => {
                    debug!(reservation_id = %id, status = %status, "reservation left pending before sweep");
                }
                Err(err) => {
                    error!(reservation_id = %reservation.id, error = %err, "failed to expire reservation");
                }
            }
        }
        Ok(swept)
    }

    /// Drop bus dedup marks past the retention window.
    pub async fn purge_processed_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let purged = self.store.purge_claimed_events(older_than).await?;
        if purged > 0 {
            debug!(purged, "purged processed-event marks");
        }
        Ok(purged)
    }

    /// Record a bus request id; false means the event was already handled.
    pub async fn claim_event(&self, request_id: &str) -> Result<bool> {
        self.store.claim_event(request_id).await
    }

    async fn smart_create(
        &self,
        ctx: &RequestContext,
        product_id: &str,
        hint: Option<&CatalogHint>,
    ) -> Result<StockRow> {
        let hint_status = hint
            .map(|h| h.status.trim().to_lowercase())
            .unwrap_or_default();

        // Any hint other than "upcoming", including "out_of_stock", seeds
        // sellable stock.
        let (on_hand, status) = match hint_status.as_str() {
            "upcoming" => (self.provision.upcoming_stock, StockStatus::Upcoming),
            _ => (self.provision.available_stock, StockStatus::Available),
        };

        let now = Utc::now();
        let row = StockRow {
            id: Uuid::new_v4(),
            product_id: product_id.to_string(),
            on_hand,
            reserved: 0,
            available: on_hand,
            status,
            min_stock: self.provision.min_stock,
            max_stock: self.provision.max_stock,
            reorder_point: self.provision.reorder_point,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        match self.store.create_stock(row).await {
            Ok(row) => {
                info!(
                    product_id = %product_id,
                    on_hand = row.on_hand,
                    status = %row.status,
                    hint = %hint_status,
                    actor = %ctx.actor,
                    "provisioned stock row"
                );
                Ok(row)
            }
            // Lost the race to a concurrent first reference; use theirs.
            Err(InventoryError::Conflict(_)) => self
                .store
                .get_stock(product_id)
                .await?
                .ok_or_else(|| InventoryError::Internal(format!(
                    "stock row for {} vanished after create conflict",
                    product_id
                ))),
            Err(err) => Err(err),
        }
    }

    async fn emit_updated(&self, delta: &AppliedDelta) {
        let event = InventoryUpdated::from_delta(delta);
        if let Err(err) = self.events.publish_updated(&event).await {
            self.metrics.publish_failures_total.inc();
            error!(
                product_id = %delta.product_id,
                error = %err,
                "failed to publish updated event"
            );
        }
    }

    fn note_error(&self, err: &InventoryError) {
        if matches!(err, InventoryError::VersionConflict(_)) {
            self.metrics.version_conflicts_total.inc();
        }
    }

    fn note_shortfalls(&self, reservation_id: Uuid, shortfalls: &[String]) {
        for product_id in shortfalls {
            self.metrics.release_shortfall_total.inc();
            warn!(
                reservation_id = %reservation_id,
                product_id = %product_id,
                "release found reserved below held quantity"
            );
        }
    }
}
