//! Mesh Shared Library
//!
//! Wire codec, correlation, routing and dispatch for the edge-to-cloud
//! reverse tunnel. Both the relay and the node binaries build on this crate;
//! neither the socket transport nor the local HTTP client lives here.

pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod protocol;
pub mod registry;
pub mod session;

pub use error::{Error, Result};
