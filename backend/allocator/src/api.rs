//! Axum REST API handlers.

use std::sync::Arc;

use allocation_core::{
    AllocationEngine, AllocationError, AllocationRequest, CapacityEntry, LedgerDrift,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::db::SqliteStore;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<AllocationEngine>,
    pub store: Arc<SqliteStore>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/problems/capacity", get(get_capacity))
        .route(
            "/teams/:team_id/allocation",
            get(get_allocation).delete(retract),
        )
        .route("/teams/:team_id/preferences", put(submit_preferences))
        .route("/admin/waitlist/resolve", post(resolve_waitlist))
        .route("/admin/allocations", get(list_allocations))
        .route("/admin/stats", get(get_stats))
        .route("/admin/settings/project-request", put(set_project_request))
        .route("/admin/ledger/reconcile", post(reconcile_ledger))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PreferencesRequest {
    pub preferences: Vec<String>,
}

#[derive(Deserialize)]
pub struct GateRequest {
    pub open: bool,
}

#[derive(Serialize)]
pub struct AllocationResponse {
    pub team_id: String,
    pub allocation: Option<AllocationRequest>,
}

#[derive(Serialize)]
pub struct CapacityResponse {
    pub count: usize,
    pub problems: Vec<CapacityEntry>,
}

#[derive(Serialize)]
pub struct AllocationsResponse {
    pub count: usize,
    pub allocations: Vec<AllocationRequest>,
}

#[derive(Serialize)]
pub struct GateResponse {
    pub project_request_open: bool,
}

#[derive(Serialize)]
pub struct ReconcileResponse {
    pub repaired: usize,
    pub drifts: Vec<LedgerDrift>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn status_for(err: &AllocationError) -> StatusCode {
    match err {
        AllocationError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AllocationError::AlreadyAllocated { .. } => StatusCode::CONFLICT,
        AllocationError::PhaseClosed => StatusCode::FORBIDDEN,
        AllocationError::NotFound { .. } => StatusCode::NOT_FOUND,
        AllocationError::Contention | AllocationError::Transient { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AllocationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: impl std::fmt::Display, status: StatusCode) -> Response {
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn allocation_error(err: AllocationError) -> Response {
    let status = status_for(&err);
    error_response(err, status)
}

fn ok_json<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /problems/capacity`
///
/// Capacity and live allocated count for every problem, active or not.
pub async fn get_capacity(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.capacity_snapshot().await {
        Ok(problems) => ok_json(CapacityResponse {
            count: problems.len(),
            problems,
        }),
        Err(e) => allocation_error(e),
    }
}

/// `GET /teams/:team_id/allocation`
pub async fn get_allocation(
    State(state): State<Arc<ApiState>>,
    Path(team_id): Path<String>,
) -> Response {
    match state.engine.get_allocation(&team_id).await {
        Ok(allocation) => ok_json(AllocationResponse {
            team_id,
            allocation,
        }),
        Err(e) => allocation_error(e),
    }
}

/// `PUT /teams/:team_id/preferences`
///
/// Seats the team on its first choice if there is room, otherwise
/// waitlists it. Both outcomes are `200`.
pub async fn submit_preferences(
    State(state): State<Arc<ApiState>>,
    Path(team_id): Path<String>,
    Json(body): Json<PreferencesRequest>,
) -> Response {
    match state
        .engine
        .submit_preferences(&team_id, body.preferences)
        .await
    {
        Ok(request) => ok_json(AllocationResponse {
            team_id,
            allocation: Some(request),
        }),
        Err(e) => allocation_error(e),
    }
}

/// `DELETE /teams/:team_id/allocation`
pub async fn retract(
    State(state): State<Arc<ApiState>>,
    Path(team_id): Path<String>,
) -> Response {
    match state.engine.retract(&team_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => allocation_error(e),
    }
}

/// `POST /admin/waitlist/resolve`
pub async fn resolve_waitlist(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.resolve_waitlist().await {
        Ok(result) => ok_json(result),
        Err(e) => allocation_error(e),
    }
}

/// `GET /admin/allocations`
///
/// Every request, newest first.
pub async fn list_allocations(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.list_requests().await {
        Ok(allocations) => ok_json(AllocationsResponse {
            count: allocations.len(),
            allocations,
        }),
        Err(e) => allocation_error(e),
    }
}

/// `GET /admin/stats`
pub async fn get_stats(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.stats().await {
        Ok(stats) => ok_json(stats),
        Err(e) => allocation_error(e),
    }
}

/// `PUT /admin/settings/project-request`
pub async fn set_project_request(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<GateRequest>,
) -> Response {
    match state.store.set_project_request_open(body.open).await {
        Ok(()) => ok_json(GateResponse {
            project_request_open: body.open,
        }),
        Err(e) => error_response(e, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// `POST /admin/ledger/reconcile`
pub async fn reconcile_ledger(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.reconcile_ledger().await {
        Ok(drifts) => ok_json(ReconcileResponse {
            repaired: drifts.len(),
            drifts,
        }),
        Err(e) => allocation_error(e),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
