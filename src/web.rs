//! Axum-based HTTP server exposing telemetry and supply control
//!
//! Pull telemetry comes from `/api/data`, push telemetry from the
//! `/api/events` SSE stream (one snapshot per broadcast tick). Supply
//! control and the calibration trigger mirror the bench operations
//! one-to-one; handlers stay thin and delegate to [`TestBench`].

use crate::bench::{SupplyId, TestBench};
use crate::error::BenchError;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub bench: Arc<TestBench>,
}

#[derive(Debug, Deserialize)]
pub struct SetpointBody {
    pub setpoint: f64,
}

#[derive(Debug, Deserialize)]
pub struct CalibrateBody {
    pub save_file: bool,
}

/// Map a bench error onto an HTTP response
fn error_response(err: &BenchError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        BenchError::Range { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BenchError::Timeout { .. } | BenchError::CalibrationTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        BenchError::Connection { .. } | BenchError::Io { .. } | BenchError::Protocol { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()})))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn data(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bench.snapshot())
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.bench.subscribe();
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|snapshot| Event::default().event("snapshot").json_data(&snapshot));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn psu_state(State(state): State<AppState>, Path(id): Path<SupplyId>) -> impl IntoResponse {
    let supply = state.bench.supply(id).lock().await;
    Json(serde_json::json!({"is_on": supply.is_on()}))
}

async fn psu_toggle(State(state): State<AppState>, Path(id): Path<SupplyId>) -> impl IntoResponse {
    let mut supply = state.bench.supply(id).lock().await;
    match supply.toggle_output().await {
        Ok(is_on) => (StatusCode::OK, Json(serde_json::json!({"is_on": is_on}))),
        Err(e) => error_response(&e),
    }
}

async fn psu_get_voltage(
    State(state): State<AppState>,
    Path(id): Path<SupplyId>,
) -> impl IntoResponse {
    let mut supply = state.bench.supply(id).lock().await;
    match supply.voltage().await {
        Ok(voltage) => (StatusCode::OK, Json(serde_json::json!({"voltage": voltage}))),
        Err(e) => error_response(&e),
    }
}

async fn psu_set_voltage(
    State(state): State<AppState>,
    Path(id): Path<SupplyId>,
    Json(body): Json<SetpointBody>,
) -> impl IntoResponse {
    let mut supply = state.bench.supply(id).lock().await;
    // The device stays authoritative: command, then read the setpoint back
    let result = async {
        supply.set_voltage(body.setpoint).await?;
        supply.voltage().await
    }
    .await;
    match result {
        Ok(setpoint) => (StatusCode::OK, Json(serde_json::json!({"setpoint": setpoint}))),
        Err(e) => error_response(&e),
    }
}

async fn psu_get_current(
    State(state): State<AppState>,
    Path(id): Path<SupplyId>,
) -> impl IntoResponse {
    let mut supply = state.bench.supply(id).lock().await;
    match supply.current().await {
        Ok(current) => (StatusCode::OK, Json(serde_json::json!({"current": current}))),
        Err(e) => error_response(&e),
    }
}

async fn psu_set_current(
    State(state): State<AppState>,
    Path(id): Path<SupplyId>,
    Json(body): Json<SetpointBody>,
) -> impl IntoResponse {
    let mut supply = state.bench.supply(id).lock().await;
    let result = async {
        supply.set_current(body.setpoint).await?;
        supply.current().await
    }
    .await;
    match result {
        Ok(setpoint) => (StatusCode::OK, Json(serde_json::json!({"setpoint": setpoint}))),
        Err(e) => error_response(&e),
    }
}

async fn calibrate(
    State(state): State<AppState>,
    Json(body): Json<CalibrateBody>,
) -> impl IntoResponse {
    match state.bench.calibrate(body.save_file).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "done": true,
                "k": outcome.calibration.k,
                "m": outcome.calibration.m,
                "samples": outcome.sample_count,
                "audit_file": outcome.audit_file,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/data", get(data))
        .route("/api/events", get(events))
        .route("/api/psu/{id}/state", get(psu_state))
        .route("/api/psu/{id}/toggle", post(psu_toggle))
        .route("/api/psu/{id}/voltage", get(psu_get_voltage).post(psu_set_voltage))
        .route("/api/psu/{id}/current", get(psu_get_current).post(psu_set_current))
        .route("/api/calibrate", post(calibrate))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(bench: Arc<TestBench>, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState { bench };
    let router = build_router(state);

    let logger = crate::logging::get_logger("web");
    let (addr, parsed_ok): (SocketAddr, bool) = match host.parse::<IpAddr>() {
        Ok(ip) => (SocketAddr::new(ip, port), true),
        Err(_) => (([127, 0, 0, 1], port).into(), false),
    };
    if !parsed_ok {
        logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{}",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router).await?;
    Ok(())
}
