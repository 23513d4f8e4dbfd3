//! Wire envelopes carried through the tunnel.
//!
//! Two envelope kinds travel as JSON objects, told apart by their `type`
//! field: `type_request` (cloud asks the node to perform an HTTP call) and
//! `type_response` (the node's answer, carrying the same `uuid`).

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest raw body that still fits a frame once base64-encoded, leaving
/// room for the envelope fields and headers.
pub const MAX_BODY_SIZE: usize = (MAX_MESSAGE_SIZE - 256 * 1024) / 4 * 3;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

pub const DEFAULT_PROTOCOL: &str = "HTTP/1.1";

pub const TYPE_REQUEST: &str = "type_request";
pub const TYPE_RESPONSE: &str = "type_response";

/// Name/value pairs for headers, URL parameters and post-body fields.
pub type FieldMap = BTreeMap<String, String>;

/// Matches a response frame back to the caller that sent the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh per-call identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier shared by every call to one target service.
    pub fn for_service(service: &str, port: Option<u16>) -> Self {
        match port {
            Some(port) => Self(format!("svc:{}:{}", service, port)),
            None => Self(format!("svc:{}", service)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// HTTP call forwarded from the cloud to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub version: u8,
    pub uuid: CorrelationId,
    #[serde(default)]
    pub seq_no: u64,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub method: String,
    /// Target service on the node; empty means the node's default.
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Target path on the service, always starting with `/`.
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: FieldMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: FieldMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub post: FieldMap,
    #[serde(default, rename = "raw", with = "raw_body", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl ForwardRequest {
    pub fn new(uuid: CorrelationId, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            uuid,
            seq_no: 0,
            protocol: default_protocol(),
            method: method.into(),
            service: String::new(),
            port: None,
            path: path.into(),
            headers: FieldMap::new(),
            params: FieldMap::new(),
            post: FieldMap::new(),
            body: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        check_version(self.version)?;
        check_id(&self.uuid)?;
        if self.method.is_empty() {
            return Err(Error::MalformedEnvelope("empty method".into()));
        }
        if !self.method.bytes().all(is_token_byte) {
            return Err(Error::MalformedEnvelope(format!("invalid method {:?}", self.method)));
        }
        if !self.path.starts_with('/') {
            return Err(Error::MalformedEnvelope(format!("invalid target path {:?}", self.path)));
        }
        Ok(())
    }
}

/// A node's answer to a [`ForwardRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub version: u8,
    pub uuid: CorrelationId,
    #[serde(default)]
    pub seq_no: u64,
    pub code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: FieldMap,
    #[serde(default, rename = "raw", with = "raw_body", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl ForwardResponse {
    pub fn new(uuid: CorrelationId, code: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            uuid,
            seq_no: 0,
            code,
            headers: FieldMap::new(),
            body: Vec::new(),
        }
    }

    /// Answer `request` with the given status, echoing its id and sequence number.
    pub fn reply_to(request: &ForwardRequest, code: u16) -> Self {
        Self {
            seq_no: request.seq_no,
            ..Self::new(request.uuid.clone(), code)
        }
    }

    fn validate(&self) -> Result<()> {
        check_version(self.version)?;
        check_id(&self.uuid)?;
        if !(100..=599).contains(&self.code) {
            return Err(Error::MalformedEnvelope(format!("invalid status code {}", self.code)));
        }
        Ok(())
    }
}

/// A decoded frame of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "type_request")]
    Request(ForwardRequest),
    #[serde(rename = "type_response")]
    Response(ForwardResponse),
}

impl Envelope {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Envelope::Request(r) => &r.uuid,
            Envelope::Response(r) => &r.uuid,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum EnvelopeRef<'a> {
    #[serde(rename = "type_request")]
    Request(&'a ForwardRequest),
    #[serde(rename = "type_response")]
    Response(&'a ForwardResponse),
}

pub fn encode_forward_request(request: &ForwardRequest) -> Result<Vec<u8>> {
    encode(&EnvelopeRef::Request(request))
}

pub fn encode_forward_response(response: &ForwardResponse) -> Result<Vec<u8>> {
    encode(&EnvelopeRef::Response(response))
}

// Only fails on a serializer bug: every field is a string, integer or string map.
fn encode(envelope: &EnvelopeRef<'_>) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| Error::MalformedEnvelope(e.to_string()))
}

/// Decode and validate a frame of either kind.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    check_size(frame)?;
    let envelope: Envelope =
        serde_json::from_slice(frame).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
    match &envelope {
        Envelope::Request(r) => r.validate()?,
        Envelope::Response(r) => r.validate()?,
    }
    Ok(envelope)
}

pub fn decode_forward_request(frame: &[u8]) -> Result<ForwardRequest> {
    match decode(frame)? {
        Envelope::Request(r) => Ok(r),
        Envelope::Response(_) => Err(Error::MalformedEnvelope(format!(
            "expected {}, got {}",
            TYPE_REQUEST, TYPE_RESPONSE
        ))),
    }
}

pub fn decode_forward_response(frame: &[u8]) -> Result<ForwardResponse> {
    match decode(frame)? {
        Envelope::Response(r) => Ok(r),
        Envelope::Request(_) => Err(Error::MalformedEnvelope(format!(
            "expected {}, got {}",
            TYPE_RESPONSE, TYPE_REQUEST
        ))),
    }
}

/// Salvage the correlation id of a request frame that failed to decode, so
/// the node can still answer it instead of leaving the caller to time out.
pub fn peek_correlation_id(frame: &[u8]) -> Option<CorrelationId> {
    check_size(frame).ok()?;
    let value: serde_json::Value = serde_json::from_slice(frame).ok()?;
    if value.get("type")?.as_str()? != TYPE_REQUEST {
        return None;
    }
    match value.get("uuid")?.as_str()? {
        "" => None,
        id => Some(CorrelationId::from(id)),
    }
}

/// Add a header to `headers`, joining repeats the way a proxy folds them.
pub fn fold_header(headers: &mut FieldMap, name: &str, value: &str) {
    headers
        .entry(name.to_ascii_lowercase())
        .and_modify(|existing| {
            existing.push_str(", ");
            existing.push_str(value);
        })
        .or_insert_with(|| value.to_string());
}

/// Sequence number of a request frame that failed to decode, or 0.
pub fn peek_seq_no(frame: &[u8]) -> u64 {
    check_size(frame)
        .ok()
        .and_then(|_| serde_json::from_slice::<serde_json::Value>(frame).ok())
        .and_then(|value| value.get("seq_no")?.as_u64())
        .unwrap_or(0)
}

/// Headers that describe one HTTP hop and must not be carried through the
/// tunnel. `host` and `content-length` are recomputed on the far side.
pub fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 10] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "host",
        "content-length",
    ];
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn check_size(frame: &[u8]) -> Result<()> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "frame of {} bytes exceeds {} byte limit",
            frame.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

fn check_version(version: u8) -> Result<()> {
    if version != PROTOCOL_VERSION {
        return Err(Error::MalformedEnvelope(format!("unsupported version {}", version)));
    }
    Ok(())
}

fn check_id(id: &CorrelationId) -> Result<()> {
    if id.as_str().is_empty() {
        return Err(Error::MalformedEnvelope("empty correlation id".into()));
    }
    Ok(())
}

/// RFC 9110 `tchar`
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Raw bodies travel as `{ "length": n, "data": "<base64>" }`.
mod raw_body {
    use super::{Engine, MAX_MESSAGE_SIZE, STANDARD};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Raw {
        length: usize,
        data: String,
    }

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        Raw {
            length: body.len(),
            data: STANDARD.encode(body),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = Raw::deserialize(deserializer)?;
        if raw.length > MAX_MESSAGE_SIZE {
            return Err(D::Error::custom(format!("raw length {} exceeds limit", raw.length)));
        }
        let data = STANDARD.decode(raw.data.as_bytes()).map_err(D::Error::custom)?;
        if data.len() != raw.length {
            return Err(D::Error::custom(format!(
                "raw length {} does not match {} decoded bytes",
                raw.length,
                data.len()
            )));
        }
        Ok(data)
    }
}
