//! Expiry sweeper: a single periodic task that converts past-deadline
//! pending reservations into expirations, releasing their held stock. It
//! holds no state between ticks; a tick missed behind a long sweep is
//! coalesced into the next one. On shutdown it finishes the in-flight sweep
//! and exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::context::RequestContext;
use crate::services::InventoryService;

pub struct ExpirySweeper {
    engine: Arc<InventoryService>,
    interval: Duration,
    dedup_retention: chrono::Duration,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<InventoryService>, interval_secs: u64, dedup_retention_hours: i64) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(interval_secs),
            dedup_retention: chrono::Duration::hours(dedup_retention_hours),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("expiry sweeper stopped");
    }

    async fn sweep_once(&self) {
        let timer = self.engine.metrics().sweep_duration.start_timer();
        let ctx = RequestContext::system("sweeper");

        match self.engine.sweep_expired(&ctx).await {
            Ok(0) => {}
            Ok(swept) => info!(swept, "sweep released expired reservations"),
            Err(err) => error!(error = %err, "sweep failed"),
        }

        let cutoff = Utc::now() - self.dedup_retention;
        if let Err(err) = self.engine.purge_processed_events(cutoff).await {
            error!(error = %err, "dedup purge failed");
        }

        timer.observe_duration();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::events::NullEventSink;
    use crate::metrics::Metrics;
    use crate::models::{Reservation, ReservationItem, ReservationStatus};
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn test_engine(store: Arc<InMemoryLedgerStore>) -> Arc<InventoryService> {
        Arc::new(InventoryService::new(
            store,
            Arc::new(NullEventSink),
            ProvisionConfig {
                available_stock: 100,
                upcoming_stock: 50,
                min_stock: 10,
                max_stock: 1000,
                reorder_point: 20,
            },
            15,
            Metrics::new().unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_sweeper_expires_overdue_reservations() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = test_engine(store.clone());
        let ctx = RequestContext::system("test");

        engine.check(&ctx, "P1", 1, None).await.unwrap();

        let reservation_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .create_reservation(Reservation {
                id: reservation_id,
                user_id: "u1".to_string(),
                order_id: None,
                status: ReservationStatus::Pending,
                expires_at: now - ChronoDuration::seconds(5),
                created_at: now,
                updated_at: now,
                items: vec![ReservationItem {
                    id: Uuid::new_v4(),
                    reservation_id,
                    product_id: "P1".to_string(),
                    quantity: 2,
                    created_at: now,
                }],
            })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let sweeper = ExpirySweeper::new(engine.clone(), 1, 1);
        let handle = tokio::spawn(sweeper.run(rx));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let reservation = store.get_reservation(reservation_id).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Expired);

        let stock = store.get_stock("P1").await.unwrap().unwrap();
        assert_eq!(stock.reserved, 0);
        assert_eq!(engine.metrics().reservations_expired_total.get(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = test_engine(store);

        let (tx, rx) = watch::channel(false);
        let sweeper = ExpirySweeper::new(engine, 3600, 1);
        let handle = tokio::spawn(sweeper.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop promptly")
            .unwrap();
    }
}
