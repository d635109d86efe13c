use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::pipeline::{Pipeline, RunError, Trigger};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    cache_file: PathBuf,
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cache_file = pipeline.settings().storage.cache_file.clone();
    Router::new()
        .route("/", get(index))
        .route("/precios", get(prices))
        .route("/actualizar", get(refresh))
        .with_state(AppState {
            pipeline,
            cache_file,
        })
}

/// Serve the read API until `shutdown` fires.
pub async fn serve(pipeline: Arc<Pipeline>, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(pipeline).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("server shutdown")?;
    Ok(())
}

/// Run the pipeline every `every`, starting immediately. Failures are logged
/// and the next tick tries again; a tick that finds a run in flight is skipped.
pub async fn run_scheduler(pipeline: Arc<Pipeline>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let p = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move { p.run(Trigger::Scheduled).await });
        match handle.await {
            Ok(Ok(o)) => info!(records = o.record_count, "scheduled update done"),
            Ok(Err(RunError::AlreadyRunning)) => info!("update already in progress, skipping tick"),
            Ok(Err(e)) => error!("scheduled update failed: {:#}", e),
            Err(e) => error!("scheduled update panicked: {}", e),
        }
    }
    info!("scheduler stopped");
}

fn client_ip(headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

async fn index(headers: HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> &'static str {
    info!(ip = %client_ip(&headers, peer), "GET /");
    "API PIMA funcionando. Usa /precios para ver los datos."
}

async fn prices(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    info!(ip = %client_ip(&headers, peer), "GET /precios");

    match tokio::fs::read(&state.cache_file).await {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) if e.kind() == ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No existe el archivo de cache" })),
        )
            .into_response(),
        Err(e) => {
            error!("reading cache: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "No se pudo leer el archivo de cache" })),
            )
                .into_response()
        }
    }
}

async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    info!(ip = %client_ip(&headers, peer), "GET /actualizar");

    // Own task: a dropped request does not abort a run halfway through its writes.
    let pipeline = Arc::clone(&state.pipeline);
    let handle = tokio::spawn(async move { pipeline.run(Trigger::Manual).await });

    match handle.await {
        Ok(Ok(o)) => Json(json!({
            "status": "ok",
            "mensaje": "Datos actualizados manualmente",
            "registros": o.record_count,
        }))
        .into_response(),
        Ok(Err(RunError::AlreadyRunning)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "ocupado",
                "mensaje": "Ya hay una actualización en curso",
            })),
        )
            .into_response(),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "mensaje": format!("{:#}", e) })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "mensaje": e.to_string() })),
        )
            .into_response(),
    }
}

// ── Tests ──
