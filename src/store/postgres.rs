//! Postgres ledger store.
//!
//! Every mutating operation runs inside a single transaction that locks the
//! affected stock rows (`SELECT ... FOR UPDATE` or a conditional `UPDATE`),
//! performs the write, appends history and commits. Multi-row transactions
//! touch rows in ascending `product_id` order so concurrent multi-item
//! reservations cannot deadlock. There are no application-level locks; the
//! version column is the whole concurrency mechanism.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::errors::{InventoryError, Result};
use crate::models::{
    apply_change, AppliedDelta, HistoryEntry, Operation, Reservation, ReservationItem,
    ReservationStatus, StockDelta, StockRow, StockStatus,
};
use crate::store::{clamp_history_limit, LedgerStore};

const SELECT_STOCK: &str = r#"
    SELECT id, product_id, on_hand, reserved, available, status,
           min_stock, max_stock, reorder_point, created_at, updated_at, version
    FROM inventory
"#;

pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_open_conns)
            .min_connections(cfg.max_idle_conns)
            .max_lifetime(Duration::from_secs(cfg.conn_max_lifetime_secs))
            .acquire_timeout(Duration::from_secs(5))
            .connect(&cfg.url())
            .await?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| InventoryError::Internal(format!("migration failed: {}", e)))?;
        Ok(())
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }

    async fn lock_stock(
        tx: &mut Transaction<'_, Postgres>,
        product_id: &str,
    ) -> Result<Option<StockRow>> {
        let row = sqlx::query_as::<_, StockRow>(
            r#"
            SELECT id, product_id, on_hand, reserved, available, status,
                   min_stock, max_stock, reorder_point, created_at, updated_at, version
            FROM inventory
            WHERE product_id = $1
            FOR UPDATE
            "#,
        )
        .bind(product_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        entry: &HistoryEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_history (id, product_id, quantity_before, quantity_after,
                                           quantity_change, operation_type, reference_id,
                                           reason, created_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.product_id)
        .bind(entry.quantity_before)
        .bind(entry.quantity_after)
        .bind(entry.quantity_change)
        .bind(entry.operation_type)
        .bind(&entry.reference_id)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .bind(&entry.created_by)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Write back a locked row with its derived fields, guarded by the
    /// version predicate. Under `FOR UPDATE` the predicate cannot miss.
    async fn write_locked_stock(
        tx: &mut Transaction<'_, Postgres>,
        row: &mut StockRow,
    ) -> Result<()> {
        let old_version = row.version;
        row.update_status();
        row.updated_at = Utc::now();
        row.version += 1;

        let result = sqlx::query(
            r#"
            UPDATE inventory
            SET on_hand = $1, reserved = $2, available = $3, status = $4,
                updated_at = $5, version = $6
            WHERE id = $7 AND version = $8
            "#,
        )
        .bind(row.on_hand)
        .bind(row.reserved)
        .bind(row.available)
        .bind(row.status)
        .bind(row.updated_at)
        .bind(row.version)
        .bind(row.id)
        .bind(old_version)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InventoryError::VersionConflict(row.product_id.clone()));
        }
        Ok(())
    }

    async fn provision_zero_row(
        tx: &mut Transaction<'_, Postgres>,
        product_id: &str,
    ) -> Result<StockRow> {
        let now = Utc::now();
        let row = StockRow {
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
        };

        sqlx::query(
            r#"
            INSERT INTO inventory (id, product_id, on_hand, reserved, available, status,
                                   min_stock, max_stock, reorder_point,
                                   created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(row.id)
        .bind(&row.product_id)
        .bind(row.on_hand)
        .bind(row.reserved)
        .bind(row.available)
        .bind(row.status)
        .bind(row.min_stock)
        .bind(row.max_stock)
        .bind(row.reorder_point)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.version)
        .execute(&mut **tx)
        .await?;

        debug!(product_id = %product_id, "provisioned zero-stock row");
        Ok(row)
    }

    async fn reservation_items(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: Uuid,
    ) -> Result<Vec<ReservationItem>> {
        let items = sqlx::query_as::<_, ReservationItem>(
            r#"
            SELECT id, reservation_id, product_id, quantity, created_at
            FROM inventory_reservation_items
            WHERE reservation_id = $1
            ORDER BY product_id
            "#,
        )
        .bind(reservation_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(items)
    }

    /// Flip a pending reservation into a terminal status. Exactly one of two
    /// concurrent confirm/cancel calls wins this CAS; the loser sees
    /// `BadState` (or `NotFound` for an unknown id).
    async fn transition_reservation(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: Uuid,
        to_status: ReservationStatus,
        order_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_reservations
            SET status = $1, order_id = COALESCE($2, order_id), updated_at = $3
            WHERE id = $4 AND status = 'pending'
            "#,
        )
        .bind(to_status)
        .bind(order_id)
        .bind(Utc::now())
        .bind(reservation_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            let status = sqlx::query_scalar::<_, ReservationStatus>(
                "SELECT status FROM inventory_reservations WHERE id = $1",
            )
            .bind(reservation_id)
            .fetch_optional(&mut **tx)
            .await?;

            return match status {
                None => Err(InventoryError::NotFound(reservation_id)),
                Some(status) => Err(InventoryError::BadState {
                    id: reservation_id,
                    status,
                }),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn get_stock(&self, product_id: &str) -> Result<Option<StockRow>> {
        let row =
            sqlx::query_as::<_, StockRow>(&format!("{} WHERE product_id = $1", SELECT_STOCK))
                .bind(product_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn get_stocks(&self, product_ids: &[String]) -> Result<Vec<StockRow>> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows =
            sqlx::query_as::<_, StockRow>(&format!("{} WHERE product_id = ANY($1)", SELECT_STOCK))
                .bind(product_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn create_stock(&self, mut row: StockRow) -> Result<StockRow> {
        let now = Utc::now();
        row.created_at = now;
        row.updated_at = now;
        row.version = 1;
        row.available = row.available_of();

        let result = sqlx::query(
            r#"
            INSERT INTO inventory (id, product_id, on_hand, reserved, available, status,
                                   min_stock, max_stock, reorder_point,
                                   created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(row.id)
        .bind(&row.product_id)
        .bind(row.on_hand)
        .bind(row.reserved)
        .bind(row.available)
        .bind(row.status)
        .bind(row.min_stock)
        .bind(row.max_stock)
        .bind(row.reorder_point)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(row),
            Err(err) if Self::is_unique_violation(&err) => {
                Err(InventoryError::Conflict(row.product_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_stock(&self, row: &StockRow) -> Result<StockRow> {
        let mut next = row.clone();
        next.update_status();
        next.updated_at = Utc::now();
        next.version = row.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE inventory
            SET on_hand = $1, reserved = $2, available = $3, status = $4,
                min_stock = $5, max_stock = $6, reorder_point = $7,
                updated_at = $8, version = $9
            WHERE id = $10 AND version = $11
            "#,
        )
        .bind(next.on_hand)
        .bind(next.reserved)
        .bind(next.available)
        .bind(next.status)
        .bind(next.min_stock)
        .bind(next.max_stock)
        .bind(next.reorder_point)
        .bind(next.updated_at)
        .bind(next.version)
        .bind(next.id)
        .bind(row.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                product_id = %row.product_id,
                version = row.version,
                "optimistic lock conflict"
            );
            return Err(InventoryError::VersionConflict(row.product_id.clone()));
        }
        Ok(next)
    }

    async fn adjust_quantity(&self, delta: &StockDelta, created_by: &str) -> Result<AppliedDelta> {
        let mut tx = self.pool.begin().await?;

        let mut row = match Self::lock_stock(&mut tx, &delta.product_id).await? {
            Some(row) => row,
            None => Self::provision_zero_row(&mut tx, &delta.product_id).await?,
        };

        let old_quantity = row.on_hand;
        let old_status = row.status;
        row.on_hand = apply_change(&delta.product_id, old_quantity, delta.change)?;
        // A deduction may not eat into stock held by pending reservations;
        // the rollback also discards any row provisioned above.
        if row.on_hand < row.reserved {
            return Err(InventoryError::Underflow {
                product_id: delta.product_id.clone(),
                current: old_quantity,
                change: delta.change,
            });
        }
        Self::write_locked_stock(&mut tx, &mut row).await?;

        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            product_id: delta.product_id.clone(),
            quantity_before: old_quantity,
            quantity_after: row.on_hand,
            quantity_change: delta.change,
            operation_type: delta.operation,
            reference_id: delta.reference_id.clone(),
            reason: delta.reason.clone(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
        };
        Self::insert_history(&mut tx, &entry).await?;

        tx.commit().await?;

        debug!(
            product_id = %delta.product_id,
            old_quantity,
            new_quantity = row.on_hand,
            change = delta.change,
            operation = %delta.operation,
            "adjusted quantity"
        );

        Ok(AppliedDelta {
            product_id: delta.product_id.clone(),
            old_quantity,
            new_quantity: row.on_hand,
            change: delta.change,
            old_status,
            new_status: row.status,
            operation: delta.operation,
            reference_id: delta.reference_id.clone(),
            reason: delta.reason.clone(),
        })
    }

    async fn create_reservation(&self, mut reservation: Reservation) -> Result<Reservation> {
        let now = Utc::now();
        reservation.created_at = now;
        reservation.updated_at = now;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO inventory_reservations (id, user_id, order_id, status,
                                                expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(reservation.id)
        .bind(&reservation.user_id)
        .bind(&reservation.order_id)
        .bind(reservation.status)
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&mut *tx)
        .await?;

        // Deterministic lock order across concurrent multi-item reservations.
        let mut items = reservation.items.clone();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));

        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO inventory_reservation_items (id, reservation_id, product_id,
                                                         quantity, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(item.id)
            .bind(reservation.id)
            .bind(&item.product_id)
            .bind(item.quantity)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            // The authoritative admission control: increment the hold only
            // while enough stock remains unreserved.
            let result = sqlx::query(
                r#"
                UPDATE inventory
                SET reserved = reserved + $1,
                    available = on_hand - (reserved + $1),
                    status = CASE
                        WHEN on_hand - (reserved + $1) <= 0 THEN 'out_of_stock'
                        ELSE 'available'
                    END,
                    updated_at = $2,
                    version = version + 1
                WHERE product_id = $3 AND on_hand - reserved >= $1
                "#,
            )
            .bind(item.quantity)
            .bind(now)
            .bind(&item.product_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                let available = sqlx::query_scalar::<_, i32>(
                    "SELECT on_hand - reserved FROM inventory WHERE product_id = $1",
                )
                .bind(&item.product_id)
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or(0);

                return Err(InventoryError::Insufficient {
                    product_id: item.product_id.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }

        tx.commit().await?;

        debug!(
            reservation_id = %reservation.id,
            user_id = %reservation.user_id,
            items = reservation.items.len(),
            "created reservation"
        );
        Ok(reservation)
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        let reservation = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT id, user_id, order_id, status, expires_at, created_at, updated_at
            FROM inventory_reservations
            WHERE id = $1
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut reservation) = reservation else {
            return Ok(None);
        };

        reservation.items = sqlx::query_as::<_, ReservationItem>(
            r#"
            SELECT id, reservation_id, product_id, quantity, created_at
            FROM inventory_reservation_items
            WHERE reservation_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(reservation))
    }

    async fn confirm_reservation(
        &self,
        reservation_id: Uuid,
        order_id: &str,
    ) -> Result<Vec<AppliedDelta>> {
        let mut tx = self.pool.begin().await?;

        Self::transition_reservation(
            &mut tx,
            reservation_id,
            ReservationStatus::Confirmed,
            Some(order_id),
        )
        .await?;

        let items = Self::reservation_items(&mut tx, reservation_id).await?;
        if items.is_empty() {
            return Err(InventoryError::Internal(format!(
                "reservation {} has no items",
                reservation_id
            )));
        }

        let mut deltas = Vec::with_capacity(items.len());
        for item in &items {
            // Pre-image captured under the row lock; history is written from
            // it, never from a post-update read.
            let mut row = Self::lock_stock(&mut tx, &item.product_id)
                .await?
                .ok_or_else(|| InventoryError::Insufficient {
                    product_id: item.product_id.clone(),
                    requested: item.quantity,
                    available: 0,
                })?;

            if row.reserved < item.quantity {
                return Err(InventoryError::Insufficient {
                    product_id: item.product_id.clone(),
                    requested: item.quantity,
                    available: row.reserved,
                });
            }

            let old_quantity = row.on_hand;
            let old_status = row.status;
            row.on_hand = apply_change(&item.product_id, old_quantity, -item.quantity)?;
            row.reserved -= item.quantity;
            Self::write_locked_stock(&mut tx, &mut row).await?;

            let entry = HistoryEntry {
                id: Uuid::new_v4(),
                product_id: item.product_id.clone(),
                quantity_before: old_quantity,
                quantity_after: row.on_hand,
                quantity_change: -item.quantity,
                operation_type: Operation::Purchase,
                reference_id: order_id.to_string(),
                reason: "order confirmation".to_string(),
                created_at: Utc::now(),
                created_by: "system".to_string(),
            };
            Self::insert_history(&mut tx, &entry).await?;

            deltas.push(AppliedDelta {
                product_id: item.product_id.clone(),
                old_quantity,
                new_quantity: row.on_hand,
                change: -item.quantity,
                old_status,
                new_status: row.status,
                operation: Operation::Purchase,
                reference_id: order_id.to_string(),
                reason: "order confirmation".to_string(),
            });
        }

        tx.commit().await?;

        debug!(
            reservation_id = %reservation_id,
            order_id = %order_id,
            items = deltas.len(),
            "confirmed reservation"
        );
        Ok(deltas)
    }

    async fn release_reservation(
        &self,
        reservation_id: Uuid,
        to_status: ReservationStatus,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        Self::transition_reservation(&mut tx, reservation_id, to_status, None).await?;

        let items = Self::reservation_items(&mut tx, reservation_id).await?;

        let mut shortfalls = Vec::new();
        for item in &items {
            let result = sqlx::query(
                r#"
                UPDATE inventory
                SET reserved = reserved - $1,
                    available = on_hand - (reserved - $1),
                    status = CASE
                        WHEN on_hand - (reserved - $1) <= 0 THEN 'out_of_stock'
                        ELSE 'available'
                    END,
                    updated_at = $2,
                    version = version + 1
                WHERE product_id = $3 AND reserved >= $1
                "#,
            )
            .bind(item.quantity)
            .bind(Utc::now())
            .bind(&item.product_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                warn!(
                    product_id = %item.product_id,
                    quantity = item.quantity,
                    reservation_id = %reservation_id,
                    "could not release reserved stock"
                );
                shortfalls.push(item.product_id.clone());
            }
        }

        tx.commit().await?;
        Ok(shortfalls)
    }

    async fn list_expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut reservations = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT id, user_id, order_id, status, expires_at, created_at, updated_at
            FROM inventory_reservations
            WHERE status = 'pending' AND expires_at <= $1
            ORDER BY expires_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for reservation in &mut reservations {
            reservation.items = sqlx::query_as::<_, ReservationItem>(
                r#"
                SELECT id, reservation_id, product_id, quantity, created_at
                FROM inventory_reservation_items
                WHERE reservation_id = $1
                "#,
            )
            .bind(reservation.id)
            .fetch_all(&self.pool)
            .await?;
        }

        Ok(reservations)
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_history (id, product_id, quantity_before, quantity_after,
                                           quantity_change, operation_type, reference_id,
                                           reason, created_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.product_id)
        .bind(entry.quantity_before)
        .bind(entry.quantity_after)
        .bind(entry.quantity_change)
        .bind(entry.operation_type)
        .bind(&entry.reference_id)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .bind(&entry.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_history(
        &self,
        product_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, product_id, quantity_before, quantity_after, quantity_change,
                   operation_type, reference_id, reason, created_at, created_by
            FROM inventory_history
            WHERE product_id = $1 AND created_at BETWEEN $2 AND $3
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(product_id)
        .bind(from)
        .bind(to)
        .bind(clamp_history_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn claim_event(&self, request_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (request_id, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_claimed_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
