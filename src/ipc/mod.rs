//! Agent process IPC
//!
//! The agent runs as a separate process listening on a Unix socket. Every
//! message in either direction is one JSON document prefixed with its length
//! as a 4-byte big-endian integer.

/// Agent connection handling.
pub mod client;
/// Frame codec and JSON payload helpers.
pub mod codec;
/// Request and response documents.
pub mod protocol;

pub use client::AgentClient;
pub use protocol::{AgentRequest, AgentResponse, RequestContent};

use thiserror::Error;

/// Errors raised by the agent IPC layer
#[derive(Debug, Error)]
pub enum IpcError {
    /// Socket or framing failure
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Payload could not be encoded or decoded
    #[error("IPC JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The agent closed the connection
    #[error("Agent disconnected")]
    Disconnected,
}
