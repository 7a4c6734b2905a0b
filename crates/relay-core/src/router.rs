//! Event routing between ingestion, broker links and sockets.
//!
//! The router is the only component that touches both the hub and the
//! manager. Broker traffic reaches it through the inbound queue, drained by a
//! single pump task on the async runtime.

use crate::enrich::enrich;
use crate::hub::{BroadcastReport, SocketHub};
use crate::link::LinkEvent;
use crate::manager::{ManagerError, TenantConnectionManager};
use crate::tenant::TenantKey;
use relay_protocol::{codec, BrokerConfig, Event, LinkStatus};
use std::sync::Arc;
use tenvis_relay_transport::{SocketId, SocketSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Outcome of a submitted event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Sockets that received the event.
    pub delivered: usize,
    /// Whether the event was handed to the tenant's broker link.
    pub published: bool,
}

/// Glue between the front door, the socket hub and the broker links.
pub struct EventRouter {
    hub: Arc<SocketHub>,
    manager: Arc<TenantConnectionManager>,
}

impl EventRouter {
    /// Create a router over the given hub and manager.
    #[must_use]
    pub fn new(hub: Arc<SocketHub>, manager: Arc<TenantConnectionManager>) -> Self {
        Self { hub, manager }
    }

    /// The socket hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<SocketHub> {
        &self.hub
    }

    /// The tenant connection manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<TenantConnectionManager> {
        &self.manager
    }

    /// Route an externally submitted event.
    ///
    /// The enriched event goes to every socket of the tenant and, if the
    /// tenant has a connected link, to the broker. A missing, connecting or
    /// disconnected link skips the publish leg without error or waiting.
    pub async fn submit_event(&self, tenant: &TenantKey, event: Event) -> SubmitReport {
        let event = enrich(event);
        let report = self.hub.broadcast(tenant, &event).await;

        let mut published = false;
        if let Some(link) = self.manager.get_link(tenant) {
            if link.is_connected() {
                match link.publish(&event).await {
                    Ok(()) => published = true,
                    Err(e) => warn!(tenant = %tenant, kind = %event.kind, error = %e, "Publish failed"),
                }
            }
        }

        if report.failed > 0 {
            self.release_if_idle(tenant).await;
        }

        debug!(
            tenant = %tenant,
            kind = %event.kind,
            delivered = report.delivered,
            published,
            "Submitted event routed"
        );

        SubmitReport {
            delivered: report.delivered,
            published,
        }
    }

    /// Admit a socket, bring up the tenant's link and report its state.
    ///
    /// The `system_status` event goes to this tenant's sockets only.
    pub async fn on_socket_admitted(
        &self,
        tenant: &TenantKey,
        socket: Arc<dyn SocketSink>,
    ) -> LinkStatus {
        let socket_id = socket.id().clone();
        let count = self.hub.admit(tenant, socket);
        info!(tenant = %tenant, socket = %socket_id, sockets = count, "Socket admitted");

        let status = self.manager.ensure_connection(tenant).await;
        self.fan_out(tenant, &Event::system_status(&status)).await;
        status
    }

    /// Remove a socket, tearing down the tenant's link if it was the last one.
    pub async fn on_socket_closed(&self, tenant: &TenantKey, socket: &SocketId) {
        let remaining = self.hub.remove(tenant, socket);
        info!(tenant = %tenant, socket = %socket, sockets = remaining, "Socket closed");

        if remaining == 0 {
            self.release_if_idle(tenant).await;
        }
    }

    /// Tear down the tenant's link if it has no sockets left.
    ///
    /// The count is checked again under the tenant's slot, so a socket
    /// admitted meanwhile keeps the link.
    async fn release_if_idle(&self, tenant: &TenantKey) {
        if self.hub.socket_count(tenant) > 0 {
            return;
        }
        let torn_down = self
            .manager
            .disconnect_tenant_if(tenant, || self.hub.socket_count(tenant) == 0)
            .await;
        if torn_down {
            debug!(tenant = %tenant, "Idle tenant, broker link released");
        }
    }

    /// Broadcast to one tenant, releasing its link if failures emptied it.
    async fn fan_out(&self, tenant: &TenantKey, event: &Event) -> BroadcastReport {
        let report = self.hub.broadcast(tenant, event).await;
        if report.failed > 0 {
            self.release_if_idle(tenant).await;
        }
        report
    }

    /// Get a tenant's broker config.
    pub async fn get_config(&self, tenant: &TenantKey) -> Option<BrokerConfig> {
        self.manager.get_config(tenant).await
    }

    /// Replace a tenant's broker config and reconnect.
    ///
    /// The tenant's sockets are told the resulting link state either way.
    ///
    /// # Errors
    ///
    /// Returns the manager's error if persisting or connecting fails.
    pub async fn set_config(
        &self,
        tenant: &TenantKey,
        config: BrokerConfig,
    ) -> Result<(), ManagerError> {
        let result = self.manager.set_config(tenant, config).await;

        let status = match &result {
            Ok(()) => LinkStatus::Connected,
            Err(ManagerError::Connect(detail)) => LinkStatus::Error(detail.clone()),
            Err(ManagerError::Persist(_)) => self.manager.link_status(tenant).await,
        };
        self.fan_out(tenant, &Event::system_status(&status)).await;

        result
    }

    /// Send an event to every socket of every tenant.
    pub async fn broadcast_all(&self, event: Event) -> BroadcastReport {
        let event = enrich(event);
        let tenants = self.hub.tenants();
        let report = self.hub.broadcast_all(&event).await;
        if report.failed > 0 {
            for tenant in &tenants {
                self.release_if_idle(tenant).await;
            }
        }
        report
    }

    /// Handle one event from the inbound queue.
    ///
    /// Returns the fan-out report for relayed broker messages.
    pub async fn handle_link_event(&self, event: LinkEvent) -> Option<BroadcastReport> {
        match event {
            LinkEvent::Message {
                tenant,
                topic,
                payload,
            } => {
                trace!(tenant = %tenant, topic = %topic, "Relaying broker message");
                let data = codec::decode_broker_payload(&payload);
                let event = enrich(Event::from_broker(data));
                Some(self.fan_out(&tenant, &event).await)
            }
            LinkEvent::Status { tenant, status } => {
                info!(tenant = %tenant, status = %status, "Broker link status changed");
                self.fan_out(&tenant, &Event::system_status(&status)).await;
                None
            }
        }
    }

    /// Spawn the task that drains the inbound queue.
    ///
    /// `on_relayed` sees the report of every relayed broker message. The task
    /// ends once every sender is gone.
    pub fn spawn_inbound_pump<F>(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<LinkEvent>,
        mut on_relayed: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(BroadcastReport) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(report) = self.handle_link_event(event).await {
                    on_relayed(report);
                }
            }
            debug!("Inbound queue closed, pump stopped");
        })
    }
}
