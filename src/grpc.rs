//! gRPC façade. Mirrors the HTTP surface. Every response carries an in-band
//! `Status {code, message}` and a latency field; the transport layer only
//! fails for infrastructure problems.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tonic::{Request, Response};
use tracing::debug;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::errors::InventoryError;
use crate::models::{self, ItemRequest, Operation, StockDelta};
use crate::services::InventoryService as Engine;

pub mod proto {
    tonic::include_proto!("inventory.v1");
}

use proto::inventory_service_server::{InventoryService as InventoryRpc, InventoryServiceServer};

const GRPC_ACTOR: &str = "grpc";

pub struct InventoryGrpcServer {
    engine: Arc<Engine>,
}

impl InventoryGrpcServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn into_service(self) -> InventoryServiceServer<Self> {
        InventoryServiceServer::new(self)
    }
}

fn ok_status() -> proto::Status {
    proto::Status {
        code: proto::status::Code::Ok as i32,
        message: "success".to_string(),
    }
}

fn error_status(err: &InventoryError) -> proto::Status {
    use proto::status::Code;

    let code = match err {
        InventoryError::Validation(_) => Code::InvalidArgument,
        InventoryError::NotFound(_) => Code::NotFound,
        InventoryError::BadState { .. } => Code::Conflict,
        InventoryError::Expired(_) => Code::Conflict,
        InventoryError::VersionConflict(_) => Code::Conflict,
        InventoryError::Conflict(_) => Code::Conflict,
        InventoryError::Insufficient { .. } => Code::Insufficient,
        InventoryError::Underflow { .. } => Code::Insufficient,
        InventoryError::Overflow { .. } => Code::InvalidArgument,
        _ => Code::Error,
    };
    proto::Status {
        code: code as i32,
        message: err.to_string(),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn to_proto_stock(row: &models::StockRow) -> proto::StockRow {
    proto::StockRow {
        id: row.id.to_string(),
        product_id: row.product_id.clone(),
        on_hand: row.on_hand,
        reserved: row.reserved,
        available: row.available_of(),
        status: row.status.to_string(),
        min_stock: row.min_stock,
        max_stock: row.max_stock,
        reorder_point: row.reorder_point,
        created_at: row.created_at.to_rfc3339(),
        updated_at: row.updated_at.to_rfc3339(),
        version: row.version,
    }
}

fn to_proto_reservation(reservation: &models::Reservation) -> proto::Reservation {
    proto::Reservation {
        id: reservation.id.to_string(),
        user_id: reservation.user_id.clone(),
        order_id: reservation.order_id.clone().unwrap_or_default(),
        status: reservation.status.to_string(),
        expires_at: reservation.expires_at.to_rfc3339(),
        items: reservation
            .items
            .iter()
            .map(|item| proto::Item {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            })
            .collect(),
    }
}

fn parse_reservation_id(raw: &str) -> Result<Uuid, InventoryError> {
    Uuid::parse_str(raw)
        .map_err(|e| InventoryError::Validation(format!("invalid reservation id: {}", e)))
}

fn parse_timestamp(raw: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| InventoryError::Validation(format!("invalid timestamp: {}", e)))
}

#[tonic::async_trait]
impl InventoryRpc for InventoryGrpcServer {
    async fn check_inventory(
        &self,
        request: Request<proto::CheckInventoryRequest>,
    ) -> Result<Response<proto::CheckInventoryResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        debug!(product_id = %req.product_id, quantity = req.quantity, "grpc check");

        let hint = req.hint.map(|h| models::CatalogHint { status: h.status });
        match self
            .engine
            .check(&ctx, &req.product_id, req.quantity, hint.as_ref())
            .await
        {
            Ok((row, available)) => Ok(Response::new(proto::CheckInventoryResponse {
                stock: Some(to_proto_stock(&row)),
                available,
                result: Some(ok_status()),
                latency_ms: elapsed_ms(start),
            })),
            Err(err) => Ok(Response::new(proto::CheckInventoryResponse {
                stock: None,
                available: false,
                result: Some(error_status(&err)),
                latency_ms: elapsed_ms(start),
            })),
        }
    }

    async fn check_inventory_batch(
        &self,
        request: Request<proto::CheckInventoryBatchRequest>,
    ) -> Result<Response<proto::CheckInventoryBatchResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let items: Vec<ItemRequest> = req
            .items
            .iter()
            .map(|item| ItemRequest {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            })
            .collect();

        match self.engine.check_batch(&ctx, &items).await {
            Ok(results) => {
                let results = results
                    .into_iter()
                    .map(|(row, available)| proto::ItemAvailability {
                        product_id: row.product_id.clone(),
                        available,
                        available_quantity: row.available_of(),
                        reserved_quantity: row.reserved,
                        status: row.status.to_string(),
                        error_message: if available {
                            String::new()
                        } else {
                            "insufficient inventory".to_string()
                        },
                    })
                    .collect();
                Ok(Response::new(proto::CheckInventoryBatchResponse {
                    results,
                    result: Some(ok_status()),
                    latency_ms: elapsed_ms(start),
                }))
            }
            Err(err) => Ok(Response::new(proto::CheckInventoryBatchResponse {
                results: Vec::new(),
                result: Some(error_status(&err)),
                latency_ms: elapsed_ms(start),
            })),
        }
    }

    async fn reserve_inventory(
        &self,
        request: Request<proto::ReserveInventoryRequest>,
    ) -> Result<Response<proto::ReserveInventoryResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let items: Vec<ItemRequest> = req
            .items
            .iter()
            .map(|item| ItemRequest {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            })
            .collect();

        match self
            .engine
            .reserve(&ctx, &req.user_id, &items, req.timeout_minutes as i64)
            .await
        {
            Ok(reservation) => Ok(Response::new(proto::ReserveInventoryResponse {
                reservation: Some(to_proto_reservation(&reservation)),
                result: Some(ok_status()),
                latency_ms: elapsed_ms(start),
            })),
            Err(err) => Ok(Response::new(proto::ReserveInventoryResponse {
                reservation: None,
                result: Some(error_status(&err)),
                latency_ms: elapsed_ms(start),
            })),
        }
    }

    async fn get_reservation(
        &self,
        request: Request<proto::GetReservationRequest>,
    ) -> Result<Response<proto::GetReservationResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let outcome = match parse_reservation_id(&req.reservation_id) {
            Ok(id) => self.engine.get_reservation(&ctx, id).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(reservation) => Ok(Response::new(proto::GetReservationResponse {
                reservation: Some(to_proto_reservation(&reservation)),
                result: Some(ok_status()),
                latency_ms: elapsed_ms(start),
            })),
            Err(err) => Ok(Response::new(proto::GetReservationResponse {
                reservation: None,
                result: Some(error_status(&err)),
                latency_ms: elapsed_ms(start),
            })),
        }
    }

    async fn confirm_reservation(
        &self,
        request: Request<proto::ConfirmReservationRequest>,
    ) -> Result<Response<proto::ConfirmReservationResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let outcome = match parse_reservation_id(&req.reservation_id) {
            Ok(id) => self.engine.confirm(&ctx, id, &req.order_id).await,
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(()) => ok_status(),
            Err(err) => error_status(&err),
        };
        Ok(Response::new(proto::ConfirmReservationResponse {
            result: Some(result),
            latency_ms: elapsed_ms(start),
        }))
    }

    async fn cancel_reservation(
        &self,
        request: Request<proto::CancelReservationRequest>,
    ) -> Result<Response<proto::CancelReservationResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let reason = if req.reason.is_empty() {
            "manual cancellation".to_string()
        } else {
            req.reason
        };

        let outcome = match parse_reservation_id(&req.reservation_id) {
            Ok(id) => self.engine.cancel(&ctx, id, &reason).await,
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(()) => ok_status(),
            Err(err) => error_status(&err),
        };
        Ok(Response::new(proto::CancelReservationResponse {
            result: Some(result),
            latency_ms: elapsed_ms(start),
        }))
    }

    async fn update_inventory(
        &self,
        request: Request<proto::UpdateInventoryRequest>,
    ) -> Result<Response<proto::UpdateInventoryResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let mut deltas = Vec::with_capacity(req.updates.len());
        for update in &req.updates {
            match Operation::from_str(&update.operation_type) {
                Ok(operation) => deltas.push(StockDelta {
                    product_id: update.product_id.clone(),
                    change: update.quantity_change,
                    operation,
                    reference_id: update.reference_id.clone(),
                    reason: update.reason.clone(),
                }),
                Err(err) => {
                    return Ok(Response::new(proto::UpdateInventoryResponse {
                        results: Vec::new(),
                        result: Some(error_status(&err)),
                        latency_ms: elapsed_ms(start),
                    }));
                }
            }
        }

        let outcomes = self.engine.update_inventory(&ctx, &deltas).await;
        let results = deltas
            .iter()
            .zip(outcomes)
            .map(|(delta, outcome)| match outcome {
                Ok(applied) => proto::UpdateOutcome {
                    product_id: applied.product_id,
                    ok: true,
                    old_quantity: applied.old_quantity,
                    new_quantity: applied.new_quantity,
                    error_message: String::new(),
                },
                Err(err) => proto::UpdateOutcome {
                    product_id: delta.product_id.clone(),
                    ok: false,
                    old_quantity: 0,
                    new_quantity: 0,
                    error_message: err.to_string(),
                },
            })
            .collect();

        Ok(Response::new(proto::UpdateInventoryResponse {
            results,
            result: Some(ok_status()),
            latency_ms: elapsed_ms(start),
        }))
    }

    async fn get_history(
        &self,
        request: Request<proto::GetHistoryRequest>,
    ) -> Result<Response<proto::GetHistoryResponse>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let ctx = RequestContext::new(GRPC_ACTOR);

        let outcome = async {
            let from = parse_timestamp(&req.from)?;
            let to = parse_timestamp(&req.to)?;
            let limit = (req.limit > 0).then_some(req.limit as i64);
            self.engine
                .history(&ctx, &req.product_id, from, to, limit)
                .await
        }
        .await;

        match outcome {
            Ok(entries) => {
                let entries = entries
                    .iter()
                    .map(|e| proto::HistoryEntry {
                        id: e.id.to_string(),
                        product_id: e.product_id.clone(),
                        quantity_before: e.quantity_before,
                        quantity_after: e.quantity_after,
                        quantity_change: e.quantity_change,
                        operation_type: e.operation_type.to_string(),
                        reference_id: e.reference_id.clone(),
                        reason: e.reason.clone(),
                        created_at: e.created_at.to_rfc3339(),
                        created_by: e.created_by.clone(),
                    })
                    .collect();
                Ok(Response::new(proto::GetHistoryResponse {
                    entries,
                    result: Some(ok_status()),
                    latency_ms: elapsed_ms(start),
                }))
            }
            Err(err) => Ok(Response::new(proto::GetHistoryResponse {
                entries: Vec::new(),
                result: Some(error_status(&err)),
                latency_ms: elapsed_ms(start),
            })),
        }
    }
}
