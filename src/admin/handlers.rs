use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::schema::MiddlewareConfig;
use crate::error::GatewayError;
use crate::health::Alert;
use crate::http::server::AppState;
use crate::load_balancer::TargetStatus;
use crate::middleware::{EntryView, ResolveError, Snapshot, SyntheticRequest, TestReport};
use crate::resilience::circuit_breaker::BreakerStatus;

/// Error body returned by every admin endpoint.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    outcome: &'static str,
    message: String,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self {
            status: err.status(),
            outcome: err.outcome(),
            message: err.to_string(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Chain(e) => e.into(),
            other @ ResolveError::UnknownKind(_) => Self {
                status: StatusCode::BAD_REQUEST,
                outcome: "unknown-kind",
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "outcome": self.outcome }));
        (self.status, body).into_response()
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub routes: usize,
    pub targets: usize,
    pub middleware: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    pub timestamp: Option<u64>,
}

pub async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started_at.elapsed().as_secs(),
        routes: state.routes.routes().len(),
        targets: state.pools.targets().len(),
        middleware: state.chain.len(),
    })
}

pub async fn list_middleware(State(state): State<AppState>) -> Json<Vec<EntryView>> {
    Json(state.chain.list())
}

pub async fn get_middleware(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EntryView>, ApiError> {
    state
        .chain
        .get(&name)
        .map(|entry| Json(entry.view()))
        .ok_or_else(|| GatewayError::not_found("middleware", name).into())
}

pub async fn register_middleware(
    State(state): State<AppState>,
    Json(definition): Json<MiddlewareConfig>,
) -> Result<(StatusCode, Json<EntryView>), ApiError> {
    let handler = state.resolver.resolve(&definition.kind, &definition.config)?;
    state.chain.register(
        &definition.name,
        handler,
        definition.priority,
        definition.routes,
        &definition.phase,
        definition.config,
    )?;
    if !definition.enabled {
        state.chain.set_enabled(&definition.name, false)?;
    }
    let entry = state
        .chain
        .get(&definition.name)
        .ok_or_else(|| GatewayError::not_found("middleware", definition.name.clone()))?;
    tracing::info!(middleware = %definition.name, kind = %definition.kind, "Middleware registered via admin API");
    Ok((StatusCode::CREATED, Json(entry.view())))
}

pub async fn unregister_middleware(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.chain.unregister(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    Ok(Json(state.rollback.history(&name)?))
}

pub async fn take_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Snapshot>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.rollback.snapshot(&name)?)))
}

pub async fn rollback(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> Result<Json<Snapshot>, ApiError> {
    let timestamp = body.and_then(|Json(r)| r.timestamp);
    Ok(Json(state.rollback.rollback(&name, timestamp)?))
}

pub async fn test_middleware(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<SyntheticRequest>>,
) -> Result<Json<TestReport>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.tester.test(&name, request).await?))
}

pub async fn get_targets(State(state): State<AppState>) -> Json<Vec<TargetStatus>> {
    Json(state.pools.targets().iter().map(|t| t.status()).collect())
}

pub async fn get_breakers(State(state): State<AppState>) -> Json<Vec<BreakerStatus>> {
    Json(state.breakers.statuses())
}

pub async fn get_alerts(State(state): State<AppState>) -> Json<Vec<Alert>> {
    Json(state.recent_alerts.list())
}
