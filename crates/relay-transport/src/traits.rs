//! Socket abstraction traits for Relay.
//!
//! These traits define what the hub needs from a push socket, allowing it to
//! fan out without knowing the transport.

use async_trait::async_trait;
use relay_protocol::Event;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketId(pub String);

impl SocketId {
    /// Create a new socket ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique socket ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sock_{:x}_{}", timestamp, seq))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SocketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket was closed.
    #[error("Socket closed")]
    SocketClosed,

    /// Send did not complete in time.
    #[error("Send timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Event could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An admitted push socket.
///
/// Sends take `&self`: implementations serialize writes internally so the hub
/// can fan out from a snapshot without holding any registry lock.
#[async_trait]
pub trait SocketSink: Send + Sync {
    /// Get the socket's unique identifier.
    fn id(&self) -> &SocketId;

    /// Deliver an event to the socket.
    async fn send(&self, event: &Event) -> Result<(), TransportError>;

    /// Send a keepalive ping.
    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the socket gracefully.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the socket is still open.
    fn is_open(&self) -> bool;
}
