use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::db::Db;
use crate::device::DeviceId;
use crate::state::SharedState;

const DEFAULT_HISTORY: i64 = 50;
const MAX_HISTORY: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(shared: SharedState, db: Db) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/masters/{id}/history", get(api_history))
        .with_state(AppState { shared, db })
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn api_history(
    State(app): State<AppState>,
    Path(id): Path<DeviceId>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY);

    match app.db.get_device(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, format!("unknown device {id}")).into_response(),
        Err(e) => return internal_error(e),
    }

    match app.db.recent_state_changes(id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    error!("api error: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

#[cfg(not(feature = "tls"))]
pub async fn serve(shared: SharedState, db: Db, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(shared, db))
        .await
        .context("web server error")
}

#[cfg(feature = "tls")]
pub async fn serve(shared: SharedState, db: Db, port: u16) -> Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let cert = std::env::var("TLS_CERT").context("TLS_CERT must be set with the tls feature")?;
    let key = std::env::var("TLS_KEY").context("TLS_KEY must be set with the tls feature")?;
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .with_context(|| format!("failed to load tls cert {cert} / key {key}"))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("status api listening on https://{addr}");

    axum_server::bind_rustls(addr, tls)
        .serve(router(shared, db).into_make_service())
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
