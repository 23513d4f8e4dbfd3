//! Health, status and directory endpoints on the tunnel listener

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use mesh_shared::directory::RouteInfo;
use mesh_shared::protocol::PROTOCOL_VERSION;
use mesh_shared::session::NodeId;
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/status", get(status))
        .route("/v1/version", get(version))
        .route("/v1/metrics", get(metrics))
        .route("/v1/nodes", get(nodes))
        .route("/v1/nodes/:node_id", get(node))
}

/// Any path outside the reserved ones
pub async fn forbidden() -> impl IntoResponse {
    (StatusCode::FORBIDDEN, "Forbidden")
}

async fn ping() -> &'static str {
    "pong"
}

#[derive(Serialize)]
struct Status {
    nodes: usize,
    active_sessions: u64,
    pending_calls: usize,
    started_at: DateTime<Utc>,
}

/// 200 while at least one node is connected, 404 otherwise.
async fn status(State(state): State<AppState>) -> Response {
    let body = Status {
        nodes: state.directory.len(),
        active_sessions: state.metrics.active_sessions(),
        pending_calls: state.directory.registry().len(),
        started_at: state.started_at,
    };
    let code = if body.nodes > 0 { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (code, Json(body)).into_response()
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let text = state.metrics.to_prometheus(state.directory.registry().len()).await;
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response()
}

async fn nodes(State(state): State<AppState>) -> Json<Vec<RouteInfo>> {
    Json(state.directory.routes())
}

/// Where to reach a node: the gateway address plus its route details.
#[derive(Serialize)]
struct NodeLocation {
    node_id: NodeId,
    host: String,
    port: u16,
    route: RouteInfo,
}

async fn node(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    let route = NodeId::parse(&node_id)
        .ok()
        .and_then(|id| state.directory.route(&id));
    match route {
        Some(route) => Json(NodeLocation {
            node_id: route.node_id.clone(),
            host: state.config.advertise_host().to_string(),
            port: state.config.forward_port,
            route,
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, format!("Unknown node {}", node_id)).into_response(),
    }
}
