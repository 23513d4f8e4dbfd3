//! Error types for the mesh.

use thiserror::Error;

use crate::protocol::CorrelationId;
use crate::session::SessionId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("No route to {0}")]
    NoRoute(String),

    #[error("Call {0} already in flight")]
    DuplicateInFlight(CorrelationId),

    #[error("Timed out waiting for node response")]
    TimedOut,

    #[error("Session {0} closed")]
    SessionClosed(SessionId),

    #[error("Call cancelled by caller")]
    Cancelled,

    #[error("Correlation registry is shut down")]
    Shutdown,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Local call failed: {0}")]
    LocalCallFailure(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status the gateway returns to the original caller for this error.
    pub fn gateway_status(&self) -> u16 {
        match self {
            Error::NoRoute(_) => 404,
            Error::DuplicateInFlight(_) => 409,
            Error::Cancelled => 499,
            Error::Shutdown => 503,
            Error::TimedOut => 504,
            _ => 502,
        }
    }

    /// Short machine-readable tag, sent in the `x-mesh-error` header.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedEnvelope(_) => "malformed-envelope",
            Error::NoRoute(_) => "no-route",
            Error::DuplicateInFlight(_) => "duplicate-in-flight",
            Error::TimedOut => "timed-out",
            Error::SessionClosed(_) => "session-closed",
            Error::Cancelled => "cancelled",
            Error::Shutdown => "shutdown",
            Error::TransportFailure(_) => "transport-failure",
            Error::LocalCallFailure(_) => "local-call-failure",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_status() {
        assert_eq!(Error::TimedOut.gateway_status(), 504);
        assert_eq!(Error::NoRoute("node-1".into()).gateway_status(), 404);
        assert_eq!(Error::SessionClosed(SessionId::from_raw(3)).gateway_status(), 502);
        assert_eq!(Error::TransportFailure("queue full".into()).gateway_status(), 502);
    }
}
