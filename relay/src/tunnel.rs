//! Node-facing tunnel listener
//!
//! Each node holds one WebSocket open to `/v1/mesh`. The socket task pumps
//! the session's outbound queue onto the wire and feeds inbound response
//! frames to the correlation registry.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use mesh_shared::protocol::{self, Envelope, ForwardResponse};
use mesh_shared::session::{NodeId, Session};
use tracing::{debug, info, warn};

use crate::AppState;

/// Header carrying the node identity, on the tunnel upgrade and on gateway calls
pub const NODE_ID_HEADER: &str = "x-mesh-node-id";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let node = match node_identity(&headers) {
        Ok(node) => node,
        Err(e) => {
            warn!(peer = %peer, "rejected tunnel without node identity");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    ws.max_message_size(protocol::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, node, peer))
}

/// Node id from `X-Mesh-Node-Id`, falling back to `User-Agent`.
fn node_identity(headers: &HeaderMap) -> mesh_shared::Result<NodeId> {
    let raw = headers
        .get(NODE_ID_HEADER)
        .or_else(|| headers.get(USER_AGENT))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    NodeId::parse(raw)
}

async fn handle_socket(socket: WebSocket, state: AppState, node: NodeId, peer: SocketAddr) {
    let (session, mut outbound) = Session::open(node.clone(), Some(peer), state.config.send_queue_depth);
    state.metrics.session_opened();
    if state.directory.bind(session.clone()).is_some() {
        state.metrics.session_superseded();
    }
    info!(node = %node, session = %session.id(), peer = %peer, "node connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        state.directory.touch(&node, session.id());
                        handle_frame(&state, &session, &data);
                    }
                    Some(Ok(Message::Text(text))) => {
                        state.directory.touch(&node, session.id());
                        handle_frame(&state, &session, text.as_bytes());
                    }
                    Some(Ok(Message::Ping(d))) => {
                        state.directory.touch(&node, session.id());
                        if let Err(e) = sender.send(Message::Pong(d)).await {
                            warn!(node = %node, error = %e, "pong failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(node = %node, error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            frame = outbound.next() => {
                match frame {
                    Some(data) => {
                        if sender.send(Message::Binary(data)).await.is_err() { break; }
                    }
                    // Superseded by a reconnect, or the relay is shutting down.
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    session.close();
    let failed = state.directory.unbind(session.id());
    state.metrics.session_closed();
    info!(node = %node, session = %session.id(), failed, "node disconnected");
}

/// Route one inbound frame. Responses complete waiting calls; requests are
/// refused since the relay exposes no local services.
fn handle_frame(state: &AppState, session: &Session, frame: &[u8]) {
    match protocol::decode(frame) {
        Ok(Envelope::Response(response)) => {
            let id = response.uuid.clone();
            if state.directory.registry().resolve(session.id(), response) {
                debug!(session = %session.id(), id = %id, "response delivered");
            } else {
                state.metrics.late_response();
            }
        }
        Ok(Envelope::Request(request)) => {
            warn!(session = %session.id(), id = %request.uuid, "node-originated request refused");
            let mut response = ForwardResponse::reply_to(&request, 501);
            response.body = b"relay does not serve requests".to_vec();
            match protocol::encode_forward_response(&response) {
                Ok(frame) => {
                    if let Err(e) = session.send(frame) {
                        warn!(session = %session.id(), error = %e, "could not refuse request");
                    }
                }
                Err(e) => warn!(error = %e, "could not encode refusal"),
            }
        }
        Err(e) => {
            state.metrics.malformed_frame();
            warn!(session = %session.id(), error = %e, "dropping malformed frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_node_identity() {
        let mut h = HeaderMap::new();
        assert!(node_identity(&h).is_err());

        h.insert(USER_AGENT, HeaderValue::from_static("ukma-7001"));
        assert_eq!(node_identity(&h).unwrap().as_str(), "ukma-7001");

        h.insert(NODE_ID_HEADER, HeaderValue::from_static("node-a"));
        assert_eq!(node_identity(&h).unwrap().as_str(), "node-a");
    }
}
