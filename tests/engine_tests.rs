//! End-to-end engine scenarios against the in-memory ledger store: the
//! happy reserve/confirm and reserve/cancel paths, concurrent races,
//! auto-provisioning, the expiry sweep and bus event processing.

mod common;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{new_engine, stock_row};
use inventory_engine::context::RequestContext;
use inventory_engine::errors::InventoryError;
use inventory_engine::events::{ProductPurchased, PurchasedItem};
use inventory_engine::models::{
    ItemRequest, Operation, Reservation, ReservationItem, ReservationStatus, StockDelta,
    StockStatus,
};
use inventory_engine::nats_consumer::InboundHandler;
use inventory_engine::store::LedgerStore;

fn ctx() -> RequestContext {
    RequestContext::new("test")
}

fn item(product_id: &str, quantity: i32) -> ItemRequest {
    ItemRequest {
        product_id: product_id.to_string(),
        quantity,
    }
}

/// Insert a pending reservation directly, bypassing the engine's expiry
/// arithmetic, so tests can control `expires_at`.
async fn seed_reservation(
    store: &dyn LedgerStore,
    product_id: &str,
    quantity: i32,
    expires_at: chrono::DateTime<Utc>,
) -> Uuid {
    let reservation_id = Uuid::new_v4();
    let now = Utc::now();
    store
        .create_reservation(Reservation {
            id: reservation_id,
            user_id: "u1".to_string(),
            order_id: None,
            status: ReservationStatus::Pending,
            expires_at,
            created_at: now,
            updated_at: now,
            items: vec![ReservationItem {
                id: Uuid::new_v4(),
                reservation_id,
                product_id: product_id.to_string(),
                quantity,
                created_at: now,
            }],
        })
        .await
        .unwrap();
    reservation_id
}

#[tokio::test]
async fn test_happy_reserve_confirm() {
    let (engine, store, sink) = new_engine();
    let ctx = ctx();

    engine.check(&ctx, "P1", 1, None).await.unwrap();

    let reservation = engine
        .reserve(&ctx, "u1", &[item("P1", 3)], 15)
        .await
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Pending);

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (100, 3));

    engine.confirm(&ctx, reservation.id, "O1").await.unwrap();

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (97, 0));

    let history = engine.history(&ctx, "P1", None, None, None).await.unwrap();
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry.operation_type, Operation::Purchase);
    assert_eq!(entry.quantity_before, 100);
    assert_eq!(entry.quantity_after, 97);
    assert_eq!(entry.quantity_change, -3);
    assert_eq!(entry.reference_id, "O1");

    assert_eq!(sink.reserved.lock().await.len(), 1);
    assert_eq!(sink.confirmed.lock().await.len(), 1);
    assert_eq!(sink.updated.lock().await.len(), 1);

    let confirmed = store.get_reservation(reservation.id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!(confirmed.order_id.as_deref(), Some("O1"));
}

#[tokio::test]
async fn test_reserve_cancel_restores_stock() {
    let (engine, store, _sink) = new_engine();
    let ctx = ctx();

    engine.check(&ctx, "P1", 1, None).await.unwrap();
    let reservation = engine
        .reserve(&ctx, "u1", &[item("P1", 3)], 15)
        .await
        .unwrap();

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (100, 3));

    engine
        .cancel(&ctx, reservation.id, "user changed mind")
        .await
        .unwrap();

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (100, 0));

    let cancelled = store.get_reservation(reservation.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    // Pure reservation and release never touch on_hand, so no history.
    let history = engine.history(&ctx, "P1", None, None, None).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_concurrent_over_reservation_has_one_winner() {
    let (engine, store, _sink) = new_engine();
    store.create_stock(stock_row("P1", 5)).await.unwrap();

    let ctx1 = ctx();
    let ctx2 = ctx();
    let items1 = [item("P1", 4)];
    let items2 = [item("P1", 4)];
    let (a, b) = tokio::join!(
        engine.reserve(&ctx1, "u1", &items1, 15),
        engine.reserve(&ctx2, "u2", &items2, 15),
    );

    let outcomes = [a, b];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one reservation must win");

    let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
    match loser {
        Err(InventoryError::Insufficient {
            product_id,
            requested,
            available,
        }) => {
            assert_eq!(product_id, "P1");
            assert_eq!(*requested, 4);
            assert_eq!(*available, 1);
        }
        other => panic!("expected Insufficient, got {:?}", other),
    }

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (5, 4));
}

#[tokio::test]
async fn test_multi_item_reserve_is_atomic() {
    let (engine, store, _sink) = new_engine();
    store.create_stock(stock_row("A", 10)).await.unwrap();
    store.create_stock(stock_row("B", 1)).await.unwrap();

    let err = engine
        .reserve(&ctx(), "u1", &[item("A", 5), item("B", 2)], 15)
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::Insufficient { .. }));

    // The failed multi-item reservation must not leave a partial hold on A.
    let a = store.get_stock("A").await.unwrap().unwrap();
    assert_eq!(a.reserved, 0);
}

#[tokio::test]
async fn test_expiry_sweep_releases_stock() {
    let (engine, store, _sink) = new_engine();
    let ctx = ctx();

    engine.check(&ctx, "P1", 1, None).await.unwrap();
    let reservation_id =
        seed_reservation(store.as_ref(), "P1", 2, Utc::now() - Duration::seconds(30)).await;

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!(stock.reserved, 2);

    let swept = engine.sweep_expired(&ctx).await.unwrap();
    assert_eq!(swept, 1);

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (100, 0));

    let reservation = store.get_reservation(reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);

    // The sweeper got there first; a late confirm is a state error.
    let err = engine.confirm(&ctx, reservation_id, "O1").await.unwrap_err();
    assert!(matches!(err, InventoryError::BadState { .. }));
}

#[tokio::test]
async fn test_confirm_after_expiry_without_sweep() {
    let (engine, store, _sink) = new_engine();
    let ctx = ctx();

    engine.check(&ctx, "P1", 1, None).await.unwrap();
    let reservation_id =
        seed_reservation(store.as_ref(), "P1", 2, Utc::now() - Duration::seconds(1)).await;

    let err = engine.confirm(&ctx, reservation_id, "O1").await.unwrap_err();
    assert!(matches!(err, InventoryError::Expired(_)));
}

#[tokio::test]
async fn test_smart_create_upcoming_hint() {
    let (engine, store, _sink) = new_engine();
    let ctx = ctx();

    let hint = inventory_engine::models::CatalogHint {
        status: "upcoming".to_string(),
    };
    let (row, available) = engine.check(&ctx, "P2", 1, Some(&hint)).await.unwrap();
    assert_eq!(row.on_hand, 50);
    assert_eq!(row.reserved, 0);
    assert_eq!(row.status, StockStatus::Upcoming);
    assert!(available);

    let (_, available) = engine.check(&ctx, "P2", 999, None).await.unwrap();
    assert!(!available);

    // The hint only matters at first reference.
    let stored = store.get_stock("P2").await.unwrap().unwrap();
    assert_eq!(stored.on_hand, 50);
}

#[tokio::test]
async fn test_smart_create_ignores_out_of_stock_hint() {
    let (engine, _store, _sink) = new_engine();

    let hint = inventory_engine::models::CatalogHint {
        status: "out_of_stock".to_string(),
    };
    let (row, available) = engine.check(&ctx(), "P3", 1, Some(&hint)).await.unwrap();
    assert_eq!(row.on_hand, 100);
    assert_eq!(row.status, StockStatus::Available);
    assert!(available);
}

#[tokio::test]
async fn test_reserve_against_missing_stock_auto_provisions() {
    let (engine, store, _sink) = new_engine();

    let reservation = engine
        .reserve(&ctx(), "u1", &[item("P9", 3)], 15)
        .await
        .unwrap();
    assert_eq!(reservation.items.len(), 1);

    let stock = store.get_stock("P9").await.unwrap().unwrap();
    assert_eq!((stock.on_hand, stock.reserved), (100, 3));
}

#[tokio::test]
async fn test_batch_check_is_read_only() {
    let (engine, store, _sink) = new_engine();
    let ctx = ctx();

    store.create_stock(stock_row("A", 10)).await.unwrap();

    let results = engine
        .check_batch(&ctx, &[item("A", 5), item("MISSING", 1)])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].1);
    assert!(!results[1].1);
    assert_eq!(results[1].0.on_hand, 0);
    assert_eq!(results[1].0.status, StockStatus::OutOfStock);

    // Unknown products must not be provisioned by a batch check.
    assert!(store.get_stock("MISSING").await.unwrap().is_none());
}

#[tokio::test]
async fn test_validation_errors() {
    let (engine, _store, _sink) = new_engine();
    let ctx = ctx();

    assert!(matches!(
        engine.check(&ctx, "P1", 0, None).await,
        Err(InventoryError::Validation(_))
    ));
    assert!(matches!(
        engine.check(&ctx, "", 1, None).await,
        Err(InventoryError::Validation(_))
    ));
    assert!(matches!(
        engine.reserve(&ctx, "", &[item("P1", 1)], 15).await,
        Err(InventoryError::Validation(_))
    ));
    assert!(matches!(
        engine.reserve(&ctx, "u1", &[], 15).await,
        Err(InventoryError::Validation(_))
    ));
    assert!(matches!(
        engine.reserve(&ctx, "u1", &[item("P1", -2)], 15).await,
        Err(InventoryError::Validation(_))
    ));

    let outcomes = engine
        .update_inventory(
            &ctx,
            &[StockDelta {
                product_id: "P1".to_string(),
                change: 0,
                operation: Operation::Adjustment,
                reference_id: "ADJ-1".to_string(),
                reason: "noop".to_string(),
            }],
        )
        .await;
    assert!(matches!(
        outcomes[0],
        Err(InventoryError::Validation(_))
    ));
}

#[tokio::test]
async fn test_default_timeout_applied() {
    let (engine, _store, _sink) = new_engine();
    let before = Utc::now();

    let reservation = engine
        .reserve(&ctx(), "u1", &[item("P1", 1)], 0)
        .await
        .unwrap();

    let expected = before + Duration::minutes(15);
    let skew = (reservation.expires_at - expected).num_seconds().abs();
    assert!(skew <= 5, "expiry should default to 15 minutes out");
}

#[tokio::test]
async fn test_history_limit_clamped() {
    let (engine, _store, _sink) = new_engine();
    let ctx = ctx();

    for i in 0..1005 {
        let outcomes = engine
            .update_inventory(
                &ctx,
                &[StockDelta {
                    product_id: "P1".to_string(),
                    change: 1,
                    operation: Operation::Restock,
                    reference_id: format!("R-{}", i),
                    reason: "refill".to_string(),
                }],
            )
            .await;
        outcomes[0].as_ref().unwrap();
    }

    let capped = engine
        .history(&ctx, "P1", None, None, Some(5000))
        .await
        .unwrap();
    assert_eq!(capped.len(), 1000);

    let recent = engine
        .history(&ctx, "P1", None, None, Some(2))
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].reference_id, "R-1004");
}

#[tokio::test]
async fn test_update_inventory_reports_per_delta() {
    let (engine, store, sink) = new_engine();
    let ctx = ctx();
    store.create_stock(stock_row("A", 1)).await.unwrap();

    let outcomes = engine
        .update_inventory(
            &ctx,
            &[
                StockDelta {
                    product_id: "A".to_string(),
                    change: -5,
                    operation: Operation::Purchase,
                    reference_id: "O1".to_string(),
                    reason: "oversell".to_string(),
                },
                StockDelta {
                    product_id: "B".to_string(),
                    change: 7,
                    operation: Operation::Restock,
                    reference_id: "R1".to_string(),
                    reason: "refill".to_string(),
                },
            ],
        )
        .await;

    assert!(matches!(outcomes[0], Err(InventoryError::Underflow { .. })));
    let applied = outcomes[1].as_ref().unwrap();
    assert_eq!(applied.old_quantity, 0);
    assert_eq!(applied.new_quantity, 7);

    // The failed delta must not suppress the successful one's event.
    assert_eq!(sink.updated.lock().await.len(), 1);

    // B was auto-provisioned as a zero row by the adjust path.
    let b = store.get_stock("B").await.unwrap().unwrap();
    assert_eq!(b.on_hand, 7);
    assert_eq!(b.status, StockStatus::Available);
}

#[tokio::test]
async fn test_concurrent_confirm_cancel_single_winner() {
    let (engine, store, _sink) = new_engine();
    let ctx = ctx();

    engine.check(&ctx, "P1", 1, None).await.unwrap();
    let reservation = engine
        .reserve(&ctx, "u1", &[item("P1", 2)], 15)
        .await
        .unwrap();

    let (confirm, cancel) = tokio::join!(
        engine.confirm(&ctx, reservation.id, "O1"),
        engine.cancel(&ctx, reservation.id, "changed mind"),
    );

    let wins = [confirm.is_ok(), cancel.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(wins, 1, "exactly one transition must win");

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!(stock.reserved, 0);
    if confirm.is_ok() {
        assert_eq!(stock.on_hand, 98);
    } else {
        assert_eq!(stock.on_hand, 100);
    }
}

#[tokio::test]
async fn test_confirm_unknown_reservation() {
    let (engine, _store, _sink) = new_engine();
    let err = engine
        .confirm(&ctx(), Uuid::new_v4(), "O1")
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::NotFound(_)));
}

#[tokio::test]
async fn test_update_stock_version_conflict() {
    let (_engine, store, _sink) = new_engine();
    store.create_stock(stock_row("P1", 10)).await.unwrap();

    let row = store.get_stock("P1").await.unwrap().unwrap();
    let mut first = row.clone();
    first.min_stock = 5;
    store.update_stock(&first).await.unwrap();

    // Second writer still holds the old version.
    let mut stale = row;
    stale.min_stock = 7;
    let err = store.update_stock(&stale).await.unwrap_err();
    assert!(matches!(err, InventoryError::VersionConflict(_)));
}

#[tokio::test]
async fn test_deadline_cancels_engine_calls() {
    let (engine, _store, _sink) = new_engine();
    let expired_ctx =
        RequestContext::new("test").with_deadline(Utc::now() - Duration::seconds(1));

    assert!(matches!(
        engine.check(&expired_ctx, "P1", 1, None).await,
        Err(InventoryError::Cancelled)
    ));
    assert!(matches!(
        engine.reserve(&expired_ctx, "u1", &[item("P1", 1)], 15).await,
        Err(InventoryError::Cancelled)
    ));
}

// --- bus event processing -------------------------------------------------

fn purchase_event(request_id: &str, items: Vec<PurchasedItem>) -> ProductPurchased {
    ProductPurchased {
        request_id: request_id.to_string(),
        order_id: "O1".to_string(),
        user_id: "u1".to_string(),
        items,
        purchase_time: None,
        source: Some("order-service".to_string()),
        reply_topic: None,
    }
}

fn purchased_item(product_id: &str, quantity: i32) -> PurchasedItem {
    PurchasedItem {
        product_id: product_id.to_string(),
        quantity,
        expected_inventory_status: String::new(),
    }
}

#[tokio::test]
async fn test_purchase_event_deducts_and_confirms() {
    let (engine, store, _sink) = new_engine();
    let handler = InboundHandler::new(engine.clone());

    engine.check(&ctx(), "P1", 1, None).await.unwrap();

    let event = purchase_event(
        "req-1",
        vec![purchased_item("P1", 2), purchased_item("P_NEW", 1)],
    );
    let confirmation = handler.handle_product_purchased(&event).await.unwrap();

    assert!(confirmation.success);
    assert_eq!(confirmation.processed_count, 2);
    assert_eq!(confirmation.failed_count, 0);

    assert_eq!(store.get_stock("P1").await.unwrap().unwrap().on_hand, 98);
    // Unknown product was provisioned at 100 before the deduction.
    assert_eq!(store.get_stock("P_NEW").await.unwrap().unwrap().on_hand, 99);
}

#[tokio::test]
async fn test_purchase_event_partial_failure() {
    let (engine, store, _sink) = new_engine();
    let handler = InboundHandler::new(engine.clone());

    store.create_stock(stock_row("P_LOW", 1)).await.unwrap();

    let event = purchase_event(
        "req-2",
        vec![purchased_item("P_LOW", 2), purchased_item("P_OTHER", 1)],
    );
    let confirmation = handler.handle_product_purchased(&event).await.unwrap();

    assert!(!confirmation.success);
    assert_eq!(confirmation.processed_count, 1);
    assert_eq!(confirmation.failed_count, 1);
    assert_eq!(confirmation.failed_items[0].product_id, "P_LOW");

    // Per-item independence: the failing item left its row untouched while
    // the other one still went through.
    assert_eq!(store.get_stock("P_LOW").await.unwrap().unwrap().on_hand, 1);
    assert_eq!(
        store.get_stock("P_OTHER").await.unwrap().unwrap().on_hand,
        99
    );
}

#[tokio::test]
async fn test_purchase_event_redelivery_is_deduplicated() {
    let (engine, store, _sink) = new_engine();
    let handler = InboundHandler::new(engine.clone());

    engine.check(&ctx(), "P1", 1, None).await.unwrap();

    let event = purchase_event("req-3", vec![purchased_item("P1", 2)]);
    let first = handler.handle_product_purchased(&event).await;
    assert!(first.is_some());

    let second = handler.handle_product_purchased(&event).await;
    assert!(second.is_none(), "redelivery must short-circuit");

    assert_eq!(store.get_stock("P1").await.unwrap().unwrap().on_hand, 98);
    assert_eq!(engine.metrics().events_deduplicated_total.get(), 1);
}

#[tokio::test]
async fn test_restock_event_adds_stock() {
    let (engine, store, sink) = new_engine();
    let handler = InboundHandler::new(engine.clone());

    let event = inventory_engine::events::InventoryRestock {
        restock_id: "RS-1".to_string(),
        items: vec![inventory_engine::events::RestockItem {
            product_id: "P1".to_string(),
            quantity: 25,
        }],
        reason: "weekly delivery".to_string(),
        created_by: "warehouse".to_string(),
        source: None,
    };
    handler.handle_restock(&event).await;

    let stock = store.get_stock("P1").await.unwrap().unwrap();
    assert_eq!(stock.on_hand, 25);

    let updated = sink.updated.lock().await;
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].operation_type, "restock");
    assert_eq!(updated[0].reference_id, "RS-1");
}
