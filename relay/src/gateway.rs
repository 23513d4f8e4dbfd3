//! Gateway listener
//!
//! Admin callers reach a node's services through here. The node is picked
//! by the `X-Mesh-Node-Id` header and the first path segment names the
//! service, so `GET /service-x/v1/status` runs `GET /v1/status` against
//! `service-x` on that node.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header::HOST, request::Parts, Request, StatusCode},
    response::{IntoResponse, Response},
};
use mesh_shared::forward::{ProxiedCall, ProxiedReply};
use mesh_shared::protocol::FieldMap;
use mesh_shared::session::NodeId;
use mesh_shared::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::headers::HeaderRewriter;
use crate::tunnel::NODE_ID_HEADER;
use crate::AppState;

/// Largest request body the gateway accepts. Bodies travel base64-encoded,
/// so this stays well under the frame limit.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let started = Instant::now();

    let node = match req.headers().get(NODE_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => match NodeId::parse(raw) {
            Ok(node) => node,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
        None => {
            return (StatusCode::BAD_REQUEST, "missing X-Mesh-Node-Id header").into_response();
        }
    };

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(b) => b.to_vec(),
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response(),
    };
    let bytes_in = body.len() as u64;
    // Per-node counters are kept only for nodes that have connected.
    let known_node = state.directory.route(&node).is_some();
    let call = build_call(&parts, body, &state.rewriter, peer);
    debug!(node = %node, method = %call.method, service = %call.service, path = %call.path, "gateway call");

    // Dropping this handler (caller went away) cancels the in-flight call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let forwarder = state.forwarder.clone();
    let target = node.clone();
    let task = tokio::spawn(async move { forwarder.forward(&target, call, &cancel).await });

    let (reply, failure) = match task.await {
        Ok(Ok(reply)) => (reply, None),
        Ok(Err(e)) => (ProxiedReply::from_error(&e), Some(e.kind())),
        Err(e) => {
            warn!(node = %node, error = %e, "gateway task failed");
            let e = Error::TransportFailure(e.to_string());
            (ProxiedReply::from_error(&e), Some(e.kind()))
        }
    };

    state
        .metrics
        .record_call(
            known_node.then_some(node.as_str()),
            reply.status,
            failure,
            started.elapsed().as_micros() as u64,
            bytes_in,
            reply.body.len() as u64,
        )
        .await;

    into_response(&state.rewriter, reply)
}

fn build_call(parts: &Parts, body: Vec<u8>, rewriter: &HeaderRewriter, peer: SocketAddr) -> ProxiedCall {
    let (service, port, path) = split_target(parts.uri.path());
    let params = Query::<FieldMap>::try_from_uri(&parts.uri)
        .map(|Query(params)| params)
        .unwrap_or_default();
    let host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let client_ip = peer.ip().to_string();

    ProxiedCall {
        method: parts.method.to_string(),
        service,
        port,
        path,
        headers: rewriter.rewrite_request(&parts.headers, Some(&client_ip), host),
        params,
        post: FieldMap::new(),
        body,
    }
}

/// `/{service}[:{port}]/{rest..}` into service, optional port and target path.
fn split_target(path: &str) -> (String, Option<u16>, String) {
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, format!("/{}", rest)),
        None => (trimmed, "/".to_string()),
    };
    match first.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name.to_string(), Some(port), rest),
            Err(_) => (first.to_string(), None, rest),
        },
        None => (first.to_string(), None, rest),
    }
}

fn into_response(rewriter: &HeaderRewriter, reply: ProxiedReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = rewriter.rewrite_response(&reply.headers);
    (status, headers, reply.body).into_response()
}
