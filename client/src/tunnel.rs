//! Node side of the tunnel: one WebSocket connection to the relay

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mesh_shared::config::ClientConfig;
use mesh_shared::dispatch::Dispatcher;
use mesh_shared::protocol::MAX_MESSAGE_SIZE;
use mesh_shared::session::{NodeId, Session};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Responses buffered toward the relay before new ones are dropped
const SEND_QUEUE_DEPTH: usize = 256;

/// Run one connection until it drops or `shutdown` fires.
///
/// Returns `Ok(())` only on shutdown; a lost connection is an error so the
/// caller reconnects.
pub async fn run_session(
    config: &ClientConfig,
    node: &NodeId,
    dispatcher: &Dispatcher,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!("Connecting to relay: {}", config.relay_url);

    let mut request = config
        .relay_url
        .as_str()
        .into_client_request()
        .context("Invalid relay URL")?;
    let id = HeaderValue::from_str(node.as_str()).context("Node id is not a valid header value")?;
    request.headers_mut().insert("x-mesh-node-id", id.clone());
    request.headers_mut().insert("user-agent", id);

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };
    let (ws_stream, _) = tokio::select! {
        connected = connect_async_with_config(request, Some(ws_config), false) => {
            connected.context("Failed to connect to relay server")?
        }
        _ = shutdown.cancelled() => return Ok(()),
    };
    info!(node = %node, "Tunnel active");

    let (session, mut outbound) = Session::open(node.clone(), None, SEND_QUEUE_DEPTH);
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval(config.ping_interval());
    ping.tick().await;

    let result = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => dispatcher.handle_frame(&session, &data),
                    Some(Ok(Message::Text(text))) => dispatcher.handle_frame(&session, text.as_bytes()),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(anyhow::anyhow!("Relay closed the connection"));
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break Err(e.into());
                    }
                    _ => {}
                }
            }
            frame = outbound.next() => {
                let Some(frame) = frame else {
                    break Err(anyhow::anyhow!("Session closed"));
                };
                if let Err(e) = write.send(Message::Binary(frame)).await {
                    break Err(e.into());
                }
            }
            _ = ping.tick() => {
                debug!("Sending keepalive ping");
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    break Err(e.into());
                }
            }
            _ = shutdown.cancelled() => {
                info!("Shutting down...");
                let _ = write.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    session.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::one_shot_server;
    use crate::proxy::HttpLocalService;
    use mesh_shared::protocol::{decode_forward_response, encode_forward_request, CorrelationId, ForwardRequest};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[tokio::test]
    async fn test_session_answers_relay_requests() {
        let (local_port, _seen) = one_shot_server(r#"{"status":"ok"}"#).await;

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let (id_tx, id_rx) = oneshot::channel::<String>();
        let (resp_tx, resp_rx) = oneshot::channel();

        // Fake relay: send one request, pass on the answer, wait for close.
        tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let id = req
                    .headers()
                    .get("x-mesh-node-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let _ = id_tx.send(id);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

            let mut req = ForwardRequest::new(CorrelationId::from("call-1"), "GET", "/v1/status");
            req.service = "service-x".into();
            ws.send(Message::Binary(encode_forward_request(&req).unwrap())).await.unwrap();

            let mut resp_tx = Some(resp_tx);
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => {
                        if let Some(tx) = resp_tx.take() {
                            let _ = tx.send(decode_forward_response(&data).unwrap());
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let config = ClientConfig {
            node_id: Some("node-a".into()),
            relay_url: format!("ws://{}/v1/mesh", relay_addr),
            services: [("service-x".to_string(), local_port)].into_iter().collect(),
            ..Default::default()
        };
        let node = NodeId::parse("node-a").unwrap();
        let dispatcher = Dispatcher::new(Arc::new(HttpLocalService::new(&config).unwrap()));
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let running = tokio::spawn(async move { run_session(&config, &node, &dispatcher, &stop).await });

        assert_eq!(id_rx.await.unwrap(), "node-a");
        let resp = tokio::time::timeout(Duration::from_secs(5), resp_rx).await.unwrap().unwrap();
        assert_eq!(resp.uuid.as_str(), "call-1");
        assert_eq!(resp.code, 200);
        assert_eq!(resp.body, br#"{"status":"ok"}"#);

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_error() {
        let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
        let config = ClientConfig {
            node_id: Some("node-a".into()),
            relay_url: format!("ws://127.0.0.1:{}/v1/mesh", port),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(HttpLocalService::new(&config).unwrap()));
        let node = NodeId::parse("node-a").unwrap();
        let result = run_session(&config, &node, &dispatcher, &CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
