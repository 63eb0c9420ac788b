// =============================================================================
// LAGRANGE RELAY — api.rs
// «Control plane — HTTP surface of the emulator and the edge node»
// =============================================================================
//
//   Emulator:  GET /  GET /config  POST /config?...  GET /metrics  POST /reset-metrics
//   Edge:      GET /  GET /public-key
// =============================================================================

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::emulator::{ConfigUpdate, MetricsSnapshot, NetworkConfig, NetworkEmulator};
use crate::error::Result;
use crate::predictor::StrategyKind;

// -----------------------------------------------------------------------------
// Network emulator
// -----------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ComponentStatus {
    pub component: String,
    pub status: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<NetworkConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_public_key: Option<String>,
}

impl ComponentStatus {
    fn running(component: &str) -> Self {
        ComponentStatus {
            component: component.to_string(),
            status: "running".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            config: None,
            strategy: None,
            edge_public_key: None,
        }
    }
}

async fn emulator_status_handler(State(emu): State<Arc<NetworkEmulator>>) -> Json<ComponentStatus> {
    Json(ComponentStatus {
        config: Some(emu.config().await),
        ..ComponentStatus::running("network_emulator")
    })
}

async fn get_config_handler(State(emu): State<Arc<NetworkEmulator>>) -> Json<NetworkConfig> {
    Json(emu.config().await)
}

async fn update_config_handler(
    State(emu): State<Arc<NetworkEmulator>>,
    Query(update): Query<ConfigUpdate>,
) -> Json<serde_json::Value> {
    let config = emu.update_config(&update).await;
    Json(serde_json::json!({ "status": "updated", "config": config }))
}

async fn metrics_handler(State(emu): State<Arc<NetworkEmulator>>) -> Json<MetricsSnapshot> {
    Json(emu.metrics().await)
}

async fn reset_metrics_handler(State(emu): State<Arc<NetworkEmulator>>) -> Json<serde_json::Value> {
    emu.reset_metrics().await;
    Json(serde_json::json!({ "status": "metrics_reset" }))
}

pub fn emulator_router(emu: Arc<NetworkEmulator>) -> Router {
    Router::new()
        .route("/", get(emulator_status_handler))
        .route("/config", get(get_config_handler).post(update_config_handler))
        .route("/metrics", get(metrics_handler))
        .route("/reset-metrics", post(reset_metrics_handler))
        .with_state(emu)
}

// -----------------------------------------------------------------------------
// Edge node
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EdgeInfo {
    pub strategy: StrategyKind,
    pub public_key: String,
}

async fn edge_status_handler(State(info): State<Arc<EdgeInfo>>) -> Json<ComponentStatus> {
    Json(ComponentStatus {
        strategy: Some(info.strategy.name().to_string()),
        edge_public_key: Some(info.public_key.clone()),
        ..ComponentStatus::running("edge_node")
    })
}

async fn public_key_handler(State(info): State<Arc<EdgeInfo>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "public_key": info.public_key,
        "algorithm": "Ed25519",
        "encoding": "base64",
    }))
}

pub fn edge_router(info: Arc<EdgeInfo>) -> Router {
    Router::new()
        .route("/", get(edge_status_handler))
        .route("/public-key", get(public_key_handler))
        .with_state(info)
}

pub async fn serve(router: Router, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("🌐 control API on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
