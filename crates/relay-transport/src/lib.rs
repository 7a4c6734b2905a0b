//! # relay-transport
//!
//! Push-socket abstraction layer for the Relay event relay.
//!
//! The socket hub never talks to a concrete protocol. Every admitted socket is
//! a [`SocketSink`]: something with an identity that events can be sent to.
//!
//! - **WebSocket** - axum-backed sink, enabled by the `websocket` feature
//!
//! ```rust,ignore
//! use tenvis_relay_transport::SocketSink;
//!
//! async fn notify(socket: &dyn SocketSink, event: &relay_protocol::Event) {
//!     if let Err(e) = socket.send(event).await {
//!         tracing::warn!(socket = %socket.id(), error = %e, "Delivery failed");
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{SocketId, SocketSink, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketSink;
