//! WebSocket sink implementation.
//!
//! Wraps the write half of an axum WebSocket so the hub can deliver events to
//! it while the connection handler keeps reading from the other half.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, Event};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::traits::{SocketId, SocketSink, TransportError};

/// The write half of an admitted WebSocket.
pub struct WebSocketSink {
    id: SocketId,
    sender: Mutex<SplitSink<WebSocket, Message>>,
    is_open: AtomicBool,
    closed: Notify,
}

impl WebSocketSink {
    /// Wrap the write half of a WebSocket.
    #[must_use]
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: SocketId::generate(),
            sender: Mutex::new(sender),
            is_open: AtomicBool::new(true),
            closed: Notify::new(),
        }
    }

    /// Split an upgraded WebSocket into a sink and its read half.
    #[must_use]
    pub fn split(socket: WebSocket) -> (Self, SplitStream<WebSocket>) {
        let (sender, receiver) = socket.split();
        (Self::new(sender), receiver)
    }

    /// Mark the socket closed without sending a close frame.
    ///
    /// Used when the peer has already gone away.
    pub fn mark_closed(&self) {
        self.is_open.store(false, Ordering::SeqCst);
    }

    /// Wait until [`SocketSink::close`] is called on this sink.
    ///
    /// The connection handler selects on this so a socket closed by the hub
    /// stops reading and goes through the normal close path.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::SocketClosed);
        }

        let mut sender = self.sender.lock().await;
        sender.send(message).await.map_err(|e| {
            self.is_open.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }
}

#[async_trait]
impl SocketSink for WebSocketSink {
    fn id(&self) -> &SocketId {
        &self.id
    }

    async fn send(&self, event: &Event) -> Result<(), TransportError> {
        let text = codec::encode_text(event)?;
        self.send_message(Message::Text(text)).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let was_open = self.is_open.swap(false, Ordering::SeqCst);
        // Single waiter; the permit is kept if the handler is not waiting yet.
        self.closed.notify_one();
        if !was_open {
            return Ok(()); // Already closed
        }

        debug!(socket = %self.id, "Closing WebSocket");
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
