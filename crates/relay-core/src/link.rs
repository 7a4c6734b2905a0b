//! Broker link abstraction.
//!
//! A link is one tenant's session with its external broker. Links never call
//! into the hub: anything they receive is pushed onto the bounded inbound
//! queue with a non-blocking `try_send`, and the router's pump task drains it.

use crate::tenant::TenantKey;
use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{BrokerConfig, Event, LinkStatus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Default inbound queue capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The broker could not be reached.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The broker refused the session.
    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    /// No CONNACK within the connect timeout.
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The session is not established.
    #[error("Not connected")]
    NotConnected,

    /// A request could not be handed to the client.
    #[error("Client error: {0}")]
    Client(String),

    /// The event could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),
}

/// Something a link observed, on its way to the router.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A message arrived on the tenant's subscription.
    Message {
        tenant: TenantKey,
        topic: String,
        payload: Bytes,
    },
    /// The link's connectivity changed outside of a connect/disconnect call.
    Status { tenant: TenantKey, status: LinkStatus },
}

impl LinkEvent {
    /// The tenant this event belongs to.
    #[must_use]
    pub fn tenant(&self) -> &TenantKey {
        match self {
            LinkEvent::Message { tenant, .. } | LinkEvent::Status { tenant, .. } => tenant,
        }
    }
}

/// Sending half of the inbound queue, handed to every link.
#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<LinkEvent>,
}

impl InboundSender {
    /// Enqueue an event without waiting.
    ///
    /// Returns `false` if the queue is full or the router is gone; the event
    /// is dropped in that case.
    pub fn offer(&self, event: LinkEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(tenant = %event.tenant(), "Inbound queue full, dropping broker event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Create the bounded inbound queue.
#[must_use]
pub fn inbound_channel(capacity: usize) -> (InboundSender, mpsc::Receiver<LinkEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (InboundSender { tx }, rx)
}

/// One tenant's broker session.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// The tenant this link belongs to.
    fn tenant(&self) -> &TenantKey;

    /// The config snapshot this link was created with.
    fn config(&self) -> &BrokerConfig;

    /// Establish the session and subscribe.
    ///
    /// On failure the link stays disconnected. Links do not retry.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Tear the session down. Idempotent.
    async fn disconnect(&self);

    /// Publish an event to its resolved topic.
    ///
    /// A no-op when disconnected or when no topic resolves.
    async fn publish(&self, event: &Event) -> Result<(), LinkError>;

    /// Check whether the session is established.
    fn is_connected(&self) -> bool;
}

/// Creates links for tenants.
pub trait LinkFactory: Send + Sync {
    /// Build an unconnected link for `tenant` using `config`.
    fn create(
        &self,
        tenant: &TenantKey,
        config: BrokerConfig,
        inbound: InboundSender,
    ) -> Arc<dyn BrokerLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tenant: &str) -> LinkEvent {
        LinkEvent::Message {
            tenant: TenantKey::new(tenant),
            topic: "robot/events".to_string(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn test_offer_delivers_in_order() {
        let (tx, mut rx) = inbound_channel(4);
        assert!(tx.offer(message("a")));
        assert!(tx.offer(message("b")));

        assert_eq!(rx.recv().await.unwrap().tenant().as_str(), "a");
        assert_eq!(rx.recv().await.unwrap().tenant().as_str(), "b");
    }

    #[test]
    fn test_offer_drops_when_full() {
        let (tx, _rx) = inbound_channel(1);
        assert!(tx.offer(message("a")));
        assert!(!tx.offer(message("b")));
    }

    #[test]
    fn test_offer_after_close() {
        let (tx, rx) = inbound_channel(1);
        drop(rx);
        assert!(!tx.offer(message("a")));
    }
}
