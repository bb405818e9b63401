use crate::breaker::CircuitBreaker;
use crate::metrics::FailoverMetrics;
use crate::state::StateManager;
use crate::store::SqliteStore;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use eyre::{eyre, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct HealthState {
    pub state: Arc<StateManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub store: SqliteStore,
    pub metrics: Arc<FailoverMetrics>,
}

/// Serves `GET /health` until the shutdown signal flips.
pub async fn serve(
    port: u16,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new().route("/health", get(health)).with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| eyre!("failed to bind health port {port}: {e}"))?;
    tracing::info!(port, "health endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| eyre!("health server failed: {e}"))
}

async fn health(State(app): State<HealthState>) -> Json<serde_json::Value> {
    let pending = app.store.pending_count().await.unwrap_or(0);
    Json(json!({
        "status": "ok",
        "mode": app.state.mode().to_string(),
        "breaker": app.breaker.state().to_string(),
        "pendingCars": pending,
        "sqliteFallbackCount": app.metrics.sqlite_fallback_count(),
    }))
}
