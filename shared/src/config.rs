//! Configuration file parser for the mesh
//!
//! One `mesh.yml` serves both binaries. The relay reads the `server`
//! section, the node reads the `client` section.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forward::KeyMode;
use crate::registry::DuplicatePolicy;
use crate::{Error, Result};

/// Which roles this process is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
    #[default]
    Dual,
}

impl Mode {
    pub fn is_server(self) -> bool {
        matches!(self, Mode::Server | Mode::Dual)
    }

    pub fn is_client(self) -> bool {
        matches!(self, Mode::Client | Mode::Dual)
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub mode: Mode,

    /// tracing filter directive, used when `RUST_LOG` is unset
    pub log_level: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Cloud side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// Port nodes dial into
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,

    /// Port admin callers hit to reach a node
    #[serde(default = "default_forward_port")]
    pub forward_port: u16,

    /// Host reported by the directory query (defaults to `bind_ip`)
    pub advertise_host: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    #[serde(default)]
    pub key_mode: KeyMode,

    /// Frames buffered per session before sends start failing
    #[serde(default = "default_queue_depth")]
    pub send_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            tunnel_port: default_tunnel_port(),
            forward_port: default_forward_port(),
            advertise_host: None,
            request_timeout_secs: default_request_timeout(),
            duplicate_policy: DuplicatePolicy::default(),
            key_mode: KeyMode::default(),
            send_queue_depth: default_queue_depth(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn advertise_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.bind_ip)
    }
}

/// Node side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub node_id: Option<String>,

    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Require a TLS (`wss://`) relay connection
    #[serde(default)]
    pub secure: bool,

    /// Local hostname services listen on
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Service name to local port
    #[serde(default)]
    pub services: BTreeMap<String, u16>,

    /// Port for requests naming no known service
    pub default_port: Option<u16>,

    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,

    #[serde(default = "default_reconnect")]
    pub reconnect_secs: u64,

    #[serde(default = "default_ping")]
    pub ping_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            relay_url: default_relay_url(),
            secure: false,
            local_host: default_local_host(),
            services: BTreeMap::new(),
            default_port: None,
            local_timeout_secs: default_local_timeout(),
            reconnect_secs: default_reconnect(),
            ping_secs: default_ping(),
        }
    }
}

impl ClientConfig {
    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_secs)
    }

    /// Local port for a call: an explicit port wins, then the service
    /// table, then `default_port`.
    pub fn port_for(&self, service: &str, explicit: Option<u16>) -> Option<u16> {
        explicit
            .or_else(|| self.services.get(service).copied())
            .or(self.default_port)
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_tunnel_port() -> u16 {
    8080
}

fn default_forward_port() -> u16 {
    8081
}

fn default_request_timeout() -> u64 {
    10
}

fn default_queue_depth() -> usize {
    256
}

fn default_relay_url() -> String {
    "ws://localhost:8080/v1/mesh".to_string()
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_timeout() -> u64 {
    8
}

fn default_reconnect() -> u64 {
    5
}

fn default_ping() -> u64 {
    30
}

impl MeshConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: MeshConfig =
            serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mode.is_server() {
            let server = &self.server;
            if server.tunnel_port == 0 || server.forward_port == 0 {
                return Err(Error::Config("server ports must be non-zero".into()));
            }
            if server.tunnel_port == server.forward_port {
                return Err(Error::Config(format!(
                    "tunnel_port and forward_port must differ (both {})",
                    server.tunnel_port
                )));
            }
            if server.request_timeout_secs == 0 {
                return Err(Error::Config("request_timeout_secs must be non-zero".into()));
            }
            if server.send_queue_depth == 0 {
                return Err(Error::Config("send_queue_depth must be non-zero".into()));
            }
        }

        if self.mode.is_client() {
            let client = &self.client;
            match client.node_id.as_deref().map(str::trim) {
                None | Some("") => return Err(Error::Config("client.node_id is required".into())),
                Some(_) => {}
            }
            let secure = client.relay_url.starts_with("wss://");
            if !secure && !client.relay_url.starts_with("ws://") {
                return Err(Error::Config(format!(
                    "relay_url must be ws:// or wss://, got '{}'",
                    client.relay_url
                )));
            }
            if client.secure && !secure {
                return Err(Error::Config("secure: true requires a wss:// relay_url".into()));
            }
            if client.local_timeout_secs == 0 || client.ping_secs == 0 {
                return Err(Error::Config("client timeouts must be non-zero".into()));
            }
            if let Some((name, _)) = client.services.iter().find(|(_, port)| **port == 0) {
                return Err(Error::Config(format!("invalid port 0 for service '{}'", name)));
            }
            if client.default_port == Some(0) {
                return Err(Error::Config("default_port must be non-zero".into()));
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["mesh.yml", "mesh.yaml", ".mesh.yml", ".mesh.yaml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
