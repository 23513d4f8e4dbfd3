//! Local proxy for forwarding requests

use std::future::Future;
use std::pin::Pin;

use mesh_shared::config::ClientConfig;
use mesh_shared::dispatch::{LocalReply, LocalService};
use mesh_shared::protocol::{fold_header, is_hop_by_hop, FieldMap, ForwardRequest, MAX_BODY_SIZE};
use mesh_shared::{Error, Result};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;

/// Calls services on this node over HTTP.
pub struct HttpLocalService {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpLocalService {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.local_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Forward HTTP request to local server
    async fn forward_http(&self, request: &ForwardRequest) -> Result<LocalReply> {
        let port = self
            .config
            .port_for(&request.service, request.port)
            .ok_or_else(|| Error::NoRoute(format!("service '{}' not exposed", request.service)))?;
        let host = &self.config.local_host;
        let url = format!("http://{}:{}{}", host, port, request.path);
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::MalformedEnvelope(format!("invalid method {:?}", request.method)))?;
        debug!("Proxying {} {} to {}:{}", request.method, request.path, host, port);

        let mut builder = self.client.request(method, &url);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (k, v) in &request.headers {
            if is_hop_by_hop(k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        } else if !request.post.is_empty() {
            builder = builder.form(&request.post);
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| Error::LocalCallFailure(format!("{} {}: {}", request.method, url, e)))?;

        let status = response.status().as_u16();
        let mut headers = FieldMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                fold_header(&mut headers, name.as_str(), value);
            }
        }

        if response.content_length().is_some_and(|len| len > MAX_BODY_SIZE as u64) {
            return Err(body_too_large(&url));
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::LocalCallFailure(format!("reading body from {}: {}", url, e)))?
        {
            if body.len() + chunk.len() > MAX_BODY_SIZE {
                return Err(body_too_large(&url));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(LocalReply { status, headers, body })
    }
}

fn body_too_large(url: &str) -> Error {
    Error::LocalCallFailure(format!("response from {} exceeds {} bytes", url, MAX_BODY_SIZE))
}

impl LocalService for HttpLocalService {
    fn call<'a>(
        &'a self,
        request: &'a ForwardRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LocalReply>> + Send + 'a>> {
        Box::pin(self.forward_http(request))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mesh_shared::protocol::CorrelationId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Minimal HTTP server: answers one request with `body` and hands back
    /// the raw request it received.
    pub(crate) async fn one_shot_server(body: &'static str) -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = stream.read(&mut tmp).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });
        (port, rx)
    }

    fn service(services: &[(&str, u16)], default_port: Option<u16>) -> HttpLocalService {
        let config = ClientConfig {
            services: services.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            default_port,
            ..Default::default()
        };
        HttpLocalService::new(&config).unwrap()
    }

    fn request(service: &str, method: &str, path: &str) -> ForwardRequest {
        let mut req = ForwardRequest::new(CorrelationId::generate(), method, path);
        req.service = service.into();
        req
    }

    #[tokio::test]
    async fn test_get_with_params() {
        let (port, seen) = one_shot_server(r#"{"status":"ok"}"#).await;
        let svc = service(&[("service-x", port)], None);
        let mut req = request("service-x", "GET", "/v1/status");
        req.params.insert("verbose".into(), "1".into());
        req.headers.insert("accept".into(), "application/json".into());
        req.headers.insert("connection".into(), "upgrade".into());

        let reply = svc.call(&req).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, br#"{"status":"ok"}"#);
        assert_eq!(reply.headers["content-type"], "application/json");
        assert!(!reply.headers.contains_key("connection"));

        let raw = seen.await.unwrap();
        assert!(raw.starts_with("GET /v1/status?verbose=1 HTTP/1.1\r\n"));
        assert!(raw.to_ascii_lowercase().contains("accept: application/json"));
        assert!(!raw.to_ascii_lowercase().contains("upgrade"));
    }

    #[tokio::test]
    async fn test_post_form_when_no_raw_body() {
        let (port, seen) = one_shot_server("{}").await;
        let svc = service(&[], Some(port));
        let mut req = request("", "POST", "/v1/config");
        req.post.insert("level".into(), "debug".into());

        let reply = svc.call(&req).await.unwrap();
        assert_eq!(reply.status, 200);

        let raw = seen.await.unwrap();
        assert!(raw.starts_with("POST /v1/config HTTP/1.1\r\n"));
        assert!(raw.contains("application/x-www-form-urlencoded"));
        assert!(raw.ends_with("level=debug"));
    }

    /// Answers one request with `len` bytes and no Content-Length, so the
    /// body runs until the connection closes.
    async fn unbounded_body_server(len: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut tmp = [0u8; 4096];
            let _ = stream.read(&mut tmp).await;
            let head = "HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nConnection: close\r\n\r\n";
            if stream.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let block = vec![b'x'; 64 * 1024];
            let mut sent = 0;
            while sent < len {
                let n = block.len().min(len - sent);
                if stream.write_all(&block[..n]).await.is_err() {
                    return;
                }
                sent += n;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_repeated_response_headers_are_folded() {
        let port = unbounded_body_server(16).await;
        let svc = service(&[("service-x", port)], None);
        let reply = svc.call(&request("service-x", "GET", "/")).await.unwrap();
        assert_eq!(reply.headers["set-cookie"], "a=1, b=2");
        assert_eq!(reply.body.len(), 16);
    }

    #[tokio::test]
    async fn test_oversized_body_is_local_failure() {
        let port = unbounded_body_server(MAX_BODY_SIZE + 1).await;
        let svc = service(&[("service-x", port)], None);
        let result = svc.call(&request("service-x", "GET", "/dump")).await;
        assert!(matches!(result, Err(Error::LocalCallFailure(msg)) if msg.contains("exceeds")));
    }

    #[tokio::test]
    async fn test_explicit_port_wins_over_service_table() {
        let (port, _seen) = one_shot_server("{}").await;
        let svc = service(&[("service-x", 1)], None);
        let mut req = request("service-x", "GET", "/");
        req.port = Some(port);
        assert_eq!(svc.call(&req).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_unknown_service_is_no_route() {
        let svc = service(&[("service-x", 8095)], None);
        let result = svc.call(&request("other", "GET", "/")).await;
        assert!(matches!(result, Err(Error::NoRoute(_))));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_local_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
        let svc = service(&[("service-x", port)], None);
        let result = svc.call(&request("service-x", "GET", "/")).await;
        assert!(matches!(result, Err(Error::LocalCallFailure(_))));
    }
}
