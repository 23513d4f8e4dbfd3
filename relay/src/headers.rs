//! Request/Response Header Rewriting
//!
//! Converts between axum header maps and the tunnel's flat header map,
//! dropping hop-by-hop headers and injecting standard proxy headers.

use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use mesh_shared::protocol::{fold_header, is_hop_by_hop, FieldMap};

use crate::tunnel::NODE_ID_HEADER;

/// Header rewriter configuration
#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    /// Auto-inject standard proxy headers
    pub inject_proxy_headers: bool,
}

impl Default for HeaderRewriter {
    fn default() -> Self {
        Self {
            inject_proxy_headers: true,
        }
    }
}

impl HeaderRewriter {
    /// Build the header map forwarded to the node
    pub fn rewrite_request(&self, headers: &HeaderMap, client_ip: Option<&str>, host: &str) -> FieldMap {
        let mut out = FieldMap::new();
        for (name, value) in headers {
            let name = name.as_str();
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case(NODE_ID_HEADER) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                fold_header(&mut out, name, value);
            }
        }

        if self.inject_proxy_headers {
            if let Some(ip) = client_ip {
                fold_header(&mut out, "x-forwarded-for", ip);
            }
            if !host.is_empty() {
                out.insert("x-forwarded-host".into(), host.to_string());
            }
        }
        out
    }

    /// Build the header map returned to the gateway caller
    pub fn rewrite_response(&self, headers: &FieldMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (k, v) in headers {
            if is_hop_by_hop(k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                out.insert(name, value);
            }
        }
        out
    }
}
