//! Forwarding orchestrator: drives one gateway call through the tunnel.
//!
//! ```text
//! NEW ──lookup/register/send──▶ SENT ──▶ WAITING ──▶ COMPLETED
//!  │                                        ├──────▶ TIMED_OUT
//!  └────────────── no route / send failed ──┴──────▶ ERROR
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::directory::NodeDirectory;
use crate::protocol::{self, CorrelationId, FieldMap, ForwardRequest, ForwardResponse};
use crate::session::NodeId;
use crate::{Error, Result};

/// How correlation ids are chosen for outgoing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// A fresh UUID per call.
    #[default]
    PerCall,
    /// One id per target service and port.
    PerService,
}

/// Per-call lifecycle, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    New,
    Sent,
    Waiting,
    Completed,
    TimedOut,
    Error,
}

/// An HTTP call received at the gateway, addressed to a service on a node.
#[derive(Debug, Clone, Default)]
pub struct ProxiedCall {
    pub method: String,
    pub service: String,
    pub port: Option<u16>,
    pub path: String,
    pub headers: FieldMap,
    pub params: FieldMap,
    pub post: FieldMap,
    pub body: Vec<u8>,
}

/// The HTTP response handed back to the gateway caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedReply {
    pub status: u16,
    pub headers: FieldMap,
    pub body: Vec<u8>,
}

impl ProxiedReply {
    /// Gateway-generated error response.
    pub fn from_error(error: &Error) -> Self {
        let mut headers = FieldMap::new();
        headers.insert("content-type".into(), "text/plain; charset=utf-8".into());
        headers.insert("x-mesh-error".into(), error.kind().into());
        Self {
            status: error.gateway_status(),
            headers,
            body: error.to_string().into_bytes(),
        }
    }
}

impl From<ForwardResponse> for ProxiedReply {
    fn from(response: ForwardResponse) -> Self {
        Self {
            status: response.code,
            headers: response.headers,
            body: response.body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub timeout: Duration,
    pub key_mode: KeyMode,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            key_mode: KeyMode::PerCall,
        }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    directory: NodeDirectory,
    options: ForwardOptions,
    seq: Arc<AtomicU64>,
}

impl Forwarder {
    pub fn new(directory: NodeDirectory, options: ForwardOptions) -> Self {
        Self {
            directory,
            options,
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Forward `call` to `node` and wait for its response.
    ///
    /// The whole call, including any wait for a serialized key, is bounded
    /// by the configured timeout. Cancelling `cancel` fails it at once.
    pub async fn forward(
        &self,
        node: &NodeId,
        call: ProxiedCall,
        cancel: &CancellationToken,
    ) -> Result<ProxiedReply> {
        let deadline = Instant::now() + self.options.timeout;
        let mut phase = CallPhase::New;

        let result = self.drive(node, call, cancel, deadline, &mut phase).await;
        match &result {
            Ok(reply) => debug!(node = %node, status = reply.status, ?phase, "call completed"),
            Err(e) => warn!(node = %node, error = %e, ?phase, "call failed"),
        }
        result
    }

    /// Like [`forward`](Self::forward), but folds errors into a
    /// gateway-style reply so the caller always gets a response.
    pub async fn forward_or_error(
        &self,
        node: &NodeId,
        call: ProxiedCall,
        cancel: &CancellationToken,
    ) -> ProxiedReply {
        match self.forward(node, call, cancel).await {
            Ok(reply) => reply,
            Err(e) => ProxiedReply::from_error(&e),
        }
    }

    async fn drive(
        &self,
        node: &NodeId,
        call: ProxiedCall,
        cancel: &CancellationToken,
        deadline: Instant,
        phase: &mut CallPhase,
    ) -> Result<ProxiedReply> {
        let session = self.directory.lookup(node).inspect_err(|_| *phase = CallPhase::Error)?;
        let request = self.build_request(call);
        let registry = self.directory.registry();

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            registered = tokio::time::timeout_at(deadline, registry.register(session.id(), request)) => {
                registered.unwrap_or(Err(Error::TimedOut))
            }
        };
        let handle = handle.inspect_err(|e| *phase = terminal_phase(e))?;

        let frame = protocol::encode_forward_request(handle.request())?;
        if let Err(e) = session.send(frame) {
            *phase = CallPhase::Error;
            // The handle drops here and takes its entry with it.
            return Err(Error::NoRoute(format!("node {} ({})", node, e)));
        }
        *phase = CallPhase::Sent;
        debug!(node = %node, session = %session.id(), id = %handle.id(), "request sent");

        *phase = CallPhase::Waiting;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = handle.wait(remaining, cancel).await.inspect_err(|e| *phase = terminal_phase(e))?;

        *phase = CallPhase::Completed;
        Ok(ProxiedReply::from(response))
    }

    fn build_request(&self, call: ProxiedCall) -> ForwardRequest {
        let uuid = match self.options.key_mode {
            KeyMode::PerCall => CorrelationId::generate(),
            KeyMode::PerService => CorrelationId::for_service(&call.service, call.port),
        };
        let path = if call.path.starts_with('/') {
            call.path
        } else {
            format!("/{}", call.path)
        };

        let mut request = ForwardRequest::new(uuid, call.method, path);
        request.seq_no = self.seq.fetch_add(1, Ordering::Relaxed);
        request.service = call.service;
        request.port = call.port;
        request.headers = call.headers;
        request.params = call.params;
        request.post = call.post;
        request.body = call.body;
        request
    }
}

fn terminal_phase(error: &Error) -> CallPhase {
    match error {
        Error::TimedOut => CallPhase::TimedOut,
        _ => CallPhase::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_forward_request;
    use crate::registry::{CorrelationRegistry, DuplicatePolicy};
    use crate::session::{Outbound, Session};

    fn forwarder(timeout: Duration, key_mode: KeyMode, policy: DuplicatePolicy) -> Forwarder {
        let directory = NodeDirectory::new(CorrelationRegistry::new(policy));
        Forwarder::new(directory, ForwardOptions { timeout, key_mode })
    }

    fn connect(fwd: &Forwarder, node: &str) -> (Session, Outbound) {
        let (session, outbound) = Session::open(NodeId::parse(node).unwrap(), None, 16);
        fwd.directory().bind(session.clone());
        (session, outbound)
    }

    fn status_call() -> ProxiedCall {
        ProxiedCall {
            method: "GET".into(),
            service: "service-x".into(),
            path: "/v1/status".into(),
            ..Default::default()
        }
    }

    /// Answers every request on `outbound` the way a node would.
    fn spawn_fake_node(fwd: &Forwarder, session: Session, mut outbound: Outbound, code: u16) {
        let registry = fwd.directory().registry().clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.next().await {
                let req = decode_forward_request(&frame).unwrap();
                let mut resp = ForwardResponse::reply_to(&req, code);
                resp.body = format!("{} {}", req.method, req.path).into_bytes();
                registry.resolve(session.id(), resp);
            }
        });
    }

    #[tokio::test]
    async fn test_forward_completes() {
        let fwd = forwarder(Duration::from_secs(5), KeyMode::PerCall, DuplicatePolicy::Reject);
        let (session, outbound) = connect(&fwd, "node-a");
        spawn_fake_node(&fwd, session.clone(), outbound, 200);

        let reply = fwd
            .forward(session.node(), status_call(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"GET /v1/status");
        assert!(fwd.directory().registry().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_is_no_route() {
        let fwd = forwarder(Duration::from_secs(5), KeyMode::PerCall, DuplicatePolicy::Reject);
        let reply = fwd
            .forward_or_error(&NodeId::parse("ghost").unwrap(), status_call(), &CancellationToken::new())
            .await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.headers["x-mesh-error"], "no-route");
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let fwd = forwarder(Duration::from_millis(100), KeyMode::PerCall, DuplicatePolicy::Reject);
        let (session, mut outbound) = connect(&fwd, "node-a");

        let started = Instant::now();
        let reply = fwd
            .forward_or_error(session.node(), status_call(), &CancellationToken::new())
            .await;
        assert_eq!(reply.status, 504);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(fwd.directory().registry().is_empty());

        // The request did go out; its late answer finds nobody waiting.
        let frame = outbound.next().await.unwrap();
        let req = decode_forward_request(&frame).unwrap();
        assert!(!fwd
            .directory()
            .registry()
            .resolve(session.id(), ForwardResponse::reply_to(&req, 200)));
    }

    #[tokio::test]
    async fn test_send_failure_is_no_route() {
        let fwd = forwarder(Duration::from_secs(5), KeyMode::PerCall, DuplicatePolicy::Reject);
        let (session, outbound) = Session::open(NodeId::parse("node-a").unwrap(), None, 1);
        fwd.directory().bind(session.clone());
        // Fill the one-slot queue so the next send fails.
        session.send(b"filler".to_vec()).unwrap();

        let result = fwd.forward(session.node(), status_call(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::NoRoute(_))));
        assert!(fwd.directory().registry().is_empty());
        drop(outbound);
    }

    #[tokio::test]
    async fn test_cancel_fails_before_timeout() {
        let fwd = forwarder(Duration::from_secs(30), KeyMode::PerCall, DuplicatePolicy::Reject);
        let (session, _outbound) = connect(&fwd, "node-a");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = fwd.forward(session.node(), status_call(), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(fwd.directory().registry().is_empty());
    }

    #[tokio::test]
    async fn test_node_reconnect_fails_waiting_calls() {
        let fwd = forwarder(Duration::from_secs(30), KeyMode::PerCall, DuplicatePolicy::Reject);
        let (session, _outbound) = connect(&fwd, "node-a");

        let caller = fwd.clone();
        let node = session.node().clone();
        let pending = tokio::spawn(async move {
            caller.forward_or_error(&node, status_call(), &CancellationToken::new()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_replacement, _new_outbound) = connect(&fwd, "node-a");
        let reply = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert_eq!(reply.status, 502);
        assert_eq!(reply.headers["x-mesh-error"], "session-closed");
        assert!(fwd.directory().registry().is_empty());
    }

    #[tokio::test]
    async fn test_per_service_keys_are_serialized() {
        let fwd = forwarder(Duration::from_secs(5), KeyMode::PerService, DuplicatePolicy::Serialize);
        let (session, outbound) = connect(&fwd, "node-a");
        spawn_fake_node(&fwd, session.clone(), outbound, 200);

        let mut calls = Vec::new();
        for i in 0..4 {
            let fwd = fwd.clone();
            let node = session.node().clone();
            calls.push(tokio::spawn(async move {
                let mut call = status_call();
                call.path = format!("/v1/item/{}", i);
                fwd.forward(&node, call, &CancellationToken::new()).await
            }));
        }
        for (i, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap().unwrap();
            assert_eq!(reply.body, format!("GET /v1/item/{}", i).into_bytes());
        }
        assert!(fwd.directory().registry().is_empty());
    }

    #[test]
    fn test_build_request() {
        let fwd = forwarder(Duration::from_secs(1), KeyMode::PerService, DuplicatePolicy::Serialize);
        let mut call = status_call();
        call.path = "v1/status".into();
        call.port = Some(8095);
        let a = fwd.build_request(call.clone());
        let b = fwd.build_request(call);
        assert_eq!(a.path, "/v1/status");
        assert_eq!(a.uuid.as_str(), "svc:service-x:8095");
        assert_eq!(a.uuid, b.uuid);
        assert!(b.seq_no > a.seq_no);
    }
}
