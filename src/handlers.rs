//! HTTP façade. Handlers validate argument shapes and translate engine
//! errors into status codes; business logic stays in the engine.

use std::str::FromStr;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::errors::InventoryError;
use crate::metrics::Metrics;
use crate::models::{ItemRequest, Operation, StockDelta};
use crate::services::InventoryService;

const SERVICE_NAME: &str = "inventory-engine";

/// Identity and correlation headers injected by the API gateway.
fn request_context(req: &HttpRequest) -> RequestContext {
    let actor = req
        .headers()
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("api");

    let mut ctx = RequestContext::new(actor);
    if let Some(request_id) = req
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        ctx = ctx.with_request_id(request_id);
    }
    ctx
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn readiness(engine: web::Data<Arc<InventoryService>>) -> HttpResponse {
    match engine.ready().await {
        Ok(()) => HttpResponse::Ok().json(json!({ "status": "ready" })),
        Err(err) => HttpResponse::ServiceUnavailable().json(json!({
            "status": "not_ready",
            "error": err.to_string()
        })),
    }
}

pub async fn metrics_endpoint(metrics: web::Data<Metrics>) -> HttpResponse {
    match metrics.encode() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(err) => HttpResponse::InternalServerError().json(json!({
            "error": "failed to gather metrics",
            "details": err.to_string()
        })),
    }
}

pub async fn get_inventory(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    product_id: web::Path<String>,
) -> Result<HttpResponse, InventoryError> {
    let ctx = request_context(&req);
    let (row, _) = engine.check(&ctx, &product_id, 1, None).await?;
    Ok(HttpResponse::Ok().json(row))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

pub async fn get_inventory_history(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    product_id: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, InventoryError> {
    let ctx = request_context(&req);
    let entries = engine
        .history(&ctx, &product_id, query.from, query.to, query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(entries))
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Deserialize)]
pub struct BatchCheckRequest {
    pub items: Vec<ItemPayload>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAvailability {
    pub product_id: String,
    pub available: bool,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub async fn check_inventory_batch(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    body: web::Json<BatchCheckRequest>,
) -> Result<HttpResponse, InventoryError> {
    if body.items.is_empty() {
        return Err(InventoryError::Validation("no items provided".to_string()));
    }

    let ctx = request_context(&req);
    let items: Vec<ItemRequest> = body
        .items
        .iter()
        .map(|item| ItemRequest {
            product_id: item.product_id.clone(),
            quantity: item.quantity,
        })
        .collect();

    let results = engine.check_batch(&ctx, &items).await?;

    let response: Vec<ItemAvailability> = results
        .into_iter()
        .map(|(row, available)| ItemAvailability {
            product_id: row.product_id.clone(),
            available,
            available_quantity: row.available_of(),
            reserved_quantity: row.reserved,
            status: row.status.to_string(),
            error_message: (!available).then(|| "insufficient inventory".to_string()),
        })
        .collect();

    Ok(HttpResponse::Ok().json(response))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub product_id: String,
    pub quantity_change: i32,
    pub operation_type: String,
    #[serde(default)]
    pub reference_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct UpdateInventoryRequest {
    pub updates: Vec<UpdatePayload>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub product_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_quantity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_quantity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub async fn update_inventory(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    body: web::Json<UpdateInventoryRequest>,
) -> Result<HttpResponse, InventoryError> {
    if body.updates.is_empty() {
        return Err(InventoryError::Validation("no updates provided".to_string()));
    }

    let mut deltas = Vec::with_capacity(body.updates.len());
    for update in &body.updates {
        deltas.push(StockDelta {
            product_id: update.product_id.clone(),
            change: update.quantity_change,
            operation: Operation::from_str(&update.operation_type)?,
            reference_id: update.reference_id.clone(),
            reason: update.reason.clone(),
        });
    }

    let ctx = request_context(&req);
    let outcomes = engine.update_inventory(&ctx, &deltas).await;

    let response: Vec<UpdateOutcome> = deltas
        .iter()
        .zip(outcomes)
        .map(|(delta, outcome)| match outcome {
            Ok(applied) => UpdateOutcome {
                product_id: applied.product_id,
                ok: true,
                old_quantity: Some(applied.old_quantity),
                new_quantity: Some(applied.new_quantity),
                error_message: None,
            },
            Err(err) => UpdateOutcome {
                product_id: delta.product_id.clone(),
                ok: false,
                old_quantity: None,
                new_quantity: None,
                error_message: Some(err.to_string()),
            },
        })
        .collect();

    Ok(HttpResponse::Ok().json(response))
}

#[derive(Deserialize, validator::Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    #[validate(length(min = 1, message = "user id is required"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "at least one item is required"))]
    pub items: Vec<ItemPayload>,
    #[serde(default)]
    pub timeout_minutes: i64,
}

pub async fn reserve_inventory(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    body: web::Json<ReserveRequest>,
) -> Result<HttpResponse, InventoryError> {
    validator::Validate::validate(&*body)
        .map_err(|e| InventoryError::Validation(e.to_string()))?;

    let ctx = request_context(&req);
    let items: Vec<ItemRequest> = body
        .items
        .iter()
        .map(|item| ItemRequest {
            product_id: item.product_id.clone(),
            quantity: item.quantity,
        })
        .collect();

    let reservation = engine
        .reserve(&ctx, &body.user_id, &items, body.timeout_minutes)
        .await?;

    Ok(HttpResponse::Created().json(reservation))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub order_id: String,
}

pub async fn confirm_reservation(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    reservation_id: web::Path<Uuid>,
    body: web::Json<ConfirmRequest>,
) -> Result<HttpResponse, InventoryError> {
    let ctx = request_context(&req);
    engine
        .confirm(&ctx, *reservation_id, &body.order_id)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": "reservation confirmed",
        "reservation_id": reservation_id.to_string(),
        "order_id": body.order_id
    })))
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_reservation(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    reservation_id: web::Path<Uuid>,
    body: Option<web::Json<CancelRequest>>,
) -> Result<HttpResponse, InventoryError> {
    let reason = body
        .and_then(|b| b.into_inner().reason)
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "manual cancellation".to_string());

    let ctx = request_context(&req);
    engine.cancel(&ctx, *reservation_id, &reason).await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": "reservation cancelled",
        "reservation_id": reservation_id.to_string(),
        "reason": reason
    })))
}

pub async fn get_reservation(
    req: HttpRequest,
    engine: web::Data<Arc<InventoryService>>,
    reservation_id: web::Path<Uuid>,
) -> Result<HttpResponse, InventoryError> {
    let ctx = request_context(&req);
    let reservation = engine.get_reservation(&ctx, *reservation_id).await?;
    Ok(HttpResponse::Ok().json(reservation))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/inventory/{productId}", web::get().to(get_inventory))
            .route(
                "/inventory/{productId}/history",
                web::get().to(get_inventory_history),
            )
            .route("/inventory/batch", web::post().to(check_inventory_batch))
            .route("/inventory/update", web::post().to(update_inventory))
            .route("/reservations", web::post().to(reserve_inventory))
            .route("/reservations/{id}", web::get().to(get_reservation))
            .route(
                "/reservations/{id}/confirm",
                web::post().to(confirm_reservation),
            )
            .route(
                "/reservations/{id}/cancel",
                web::post().to(cancel_reservation),
            ),
    )
    .route("/health", web::get().to(health_check))
    .route("/ready", web::get().to(readiness))
    .route("/metrics", web::get().to(metrics_endpoint));
}
