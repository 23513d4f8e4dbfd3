//! Node-side dispatcher: turns forwarded requests into local service calls
//! and sends exactly one response back per request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{self, Envelope, FieldMap, ForwardRequest, ForwardResponse};
use crate::session::Session;
use crate::{Error, Result};

/// Result of a local service call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalReply {
    pub status: u16,
    pub headers: FieldMap,
    pub body: Vec<u8>,
}

/// Something that can answer a forwarded request on the node.
///
/// Return [`Error::NoRoute`] for a service that does not exist here and
/// [`Error::LocalCallFailure`] when the service could not be reached.
pub trait LocalService: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        request: &'a ForwardRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LocalReply>> + Send + 'a>>;
}

#[derive(Clone)]
pub struct Dispatcher {
    service: Arc<dyn LocalService>,
}

impl Dispatcher {
    pub fn new(service: Arc<dyn LocalService>) -> Self {
        Self { service }
    }

    /// Run `request` against the local service. Never fails: errors become
    /// error responses carrying the request's id.
    pub async fn handle_request(&self, request: &ForwardRequest) -> ForwardResponse {
        match self.service.call(request).await {
            Ok(reply) => {
                let mut response = ForwardResponse::reply_to(request, reply.status);
                response.headers = reply.headers;
                response.body = reply.body;
                response
            }
            Err(e) => {
                warn!(id = %request.uuid, service = %request.service, path = %request.path, error = %e, "local call failed");
                error_response(request, &e)
            }
        }
    }

    /// Handle one request concurrently with any others in flight.
    pub fn dispatch(&self, session: &Session, request: ForwardRequest) {
        let dispatcher = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let response = dispatcher.handle_request(&request).await;
            send_response(&session, &response);
        });
    }

    /// Decode an inbound frame and dispatch it.
    ///
    /// A malformed frame whose id can still be read is answered with a 400;
    /// anything else unreadable is dropped.
    pub fn handle_frame(&self, session: &Session, frame: &[u8]) {
        match protocol::decode(frame) {
            Ok(Envelope::Request(request)) => {
                debug!(id = %request.uuid, method = %request.method, service = %request.service, path = %request.path, "request received");
                self.dispatch(session, request);
            }
            Ok(Envelope::Response(response)) => {
                warn!(id = %response.uuid, "unexpected response frame on node, dropping");
            }
            Err(e) => match protocol::peek_correlation_id(frame) {
                Some(id) => {
                    warn!(id = %id, error = %e, "malformed request, answering 400");
                    let mut response = ForwardResponse::new(id, 400);
                    response.seq_no = protocol::peek_seq_no(frame);
                    response.headers.insert("x-mesh-error".into(), e.kind().into());
                    response.body = e.to_string().into_bytes();
                    send_response(session, &response);
                }
                None => warn!(error = %e, "unreadable frame, dropping"),
            },
        }
    }
}

fn error_response(request: &ForwardRequest, error: &Error) -> ForwardResponse {
    let code = match error {
        Error::NoRoute(_) => 404,
        Error::MalformedEnvelope(_) => 400,
        _ => 502,
    };
    let mut response = ForwardResponse::reply_to(request, code);
    response.headers.insert("content-type".into(), "text/plain; charset=utf-8".into());
    response.headers.insert("x-mesh-error".into(), error.kind().into());
    response.body = error.to_string().into_bytes();
    response
}

fn send_response(session: &Session, response: &ForwardResponse) {
    let frame = match encode_within_limit(response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(id = %response.uuid, error = %e, "could not encode response");
            return;
        }
    };
    if let Err(e) = session.send(frame) {
        warn!(id = %response.uuid, error = %e, "response dropped");
    }
}

/// Encode `response`, swapping it for a 502 when the frame would be
/// refused by the relay.
fn encode_within_limit(response: &ForwardResponse) -> Result<Vec<u8>> {
    let frame = protocol::encode_forward_response(response)?;
    if frame.len() <= protocol::MAX_MESSAGE_SIZE {
        return Ok(frame);
    }
    warn!(id = %response.uuid, frame_len = frame.len(), "response exceeds frame limit, answering 502");
    let error = Error::LocalCallFailure(format!(
        "response of {} bytes exceeds the {} byte frame limit",
        frame.len(),
        protocol::MAX_MESSAGE_SIZE
    ));
    let mut oversized = ForwardResponse::new(response.uuid.clone(), 502);
    oversized.seq_no = response.seq_no;
    oversized.headers.insert("content-type".into(), "text/plain; charset=utf-8".into());
    oversized.headers.insert("x-mesh-error".into(), error.kind().into());
    oversized.body = error.to_string().into_bytes();
    protocol::encode_forward_response(&oversized)
}
