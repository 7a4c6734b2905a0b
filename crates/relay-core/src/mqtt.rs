//! MQTT broker links.
//!
//! Built on `rumqttc`. The client's event loop is driven by a dedicated task
//! per link; that task only ever talks to the router through the inbound
//! queue.

use crate::link::{BrokerLink, InboundSender, LinkError, LinkEvent, LinkFactory};
use crate::tenant::TenantKey;
use async_trait::async_trait;
use relay_protocol::{codec, BrokerConfig, Event, LinkStatus};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// MQTT session settings shared by every link.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Upper bound on waiting for CONNACK.
    pub connect_timeout: Duration,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Capacity of the client's request channel.
    pub request_capacity: usize,
    /// Prefix for generated client IDs.
    pub client_id_prefix: String,
    /// How long `disconnect` waits for the event loop to wind down.
    pub shutdown_grace: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            request_capacity: 64,
            client_id_prefix: "relay".to_string(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl MqttSettings {
    /// Client ID for a tenant.
    ///
    /// Derived from a hash so the key itself never reaches the broker.
    #[must_use]
    pub fn client_id(&self, tenant: &TenantKey) -> String {
        let mut hasher = DefaultHasher::new();
        tenant.as_str().hash(&mut hasher);
        format!("{}-{:016x}", self.client_id_prefix, hasher.finish())
    }
}

struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// A tenant's MQTT session.
pub struct MqttLink {
    tenant: TenantKey,
    config: BrokerConfig,
    settings: MqttSettings,
    inbound: InboundSender,
    connected: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl MqttLink {
    /// Create an unconnected link.
    #[must_use]
    pub fn new(
        tenant: TenantKey,
        config: BrokerConfig,
        settings: MqttSettings,
        inbound: InboundSender,
    ) -> Self {
        Self {
            tenant,
            config,
            settings,
            inbound,
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.settings.client_id(&self.tenant),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        if let Some((username, password)) = self.config.credentials() {
            options.set_credentials(username, password);
        }

        options
    }

    /// Poll until the broker answers the CONNECT.
    async fn await_connack(event_loop: &mut EventLoop) -> Result<(), LinkError> {
        loop {
            match event_loop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(LinkError::Rejected(format!("{:?}", ack.code)))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(LinkError::Connect(e.to_string())),
            }
        }
    }

    /// Drive the event loop until the session ends.
    async fn run(
        mut event_loop: EventLoop,
        tenant: TenantKey,
        inbound: InboundSender,
        connected: Arc<AtomicBool>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    trace!(
                        tenant = %tenant,
                        topic = %publish.topic,
                        payload_size = publish.payload.len(),
                        "Received broker message"
                    );
                    inbound.offer(LinkEvent::Message {
                        tenant: tenant.clone(),
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Ok(MqttEvent::Incoming(Packet::SubAck(ack))) => {
                    debug!(tenant = %tenant, codes = ?ack.return_codes, "Subscription acknowledged");
                }
                Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) => {
                    debug!(tenant = %tenant, "Sent disconnect, stopping event loop");
                    break;
                }
                Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                    warn!(tenant = %tenant, "Broker closed the session");
                    if connected.swap(false, Ordering::SeqCst) {
                        inbound.offer(LinkEvent::Status {
                            tenant: tenant.clone(),
                            status: LinkStatus::Disconnected,
                        });
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(tenant = %tenant, error = %e, "Broker connection lost");
                    if connected.swap(false, Ordering::SeqCst) {
                        inbound.offer(LinkEvent::Status {
                            tenant: tenant.clone(),
                            status: LinkStatus::Error(e.to_string()),
                        });
                    }
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let mut session = self.session.lock().await;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }

        debug!(
            tenant = %self.tenant,
            host = %self.config.host,
            port = self.config.port,
            "Connecting to broker"
        );

        let (client, mut event_loop) = AsyncClient::new(self.options(), self.settings.request_capacity);

        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, Self::await_connack(&mut event_loop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(LinkError::Timeout(timeout));
            }
        }

        if let Some(topic) = self.config.subscribe_topic() {
            if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
                self.connected.store(false, Ordering::SeqCst);
                return Err(LinkError::Client(e.to_string()));
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(Self::run(
            event_loop,
            self.tenant.clone(),
            self.inbound.clone(),
            self.connected.clone(),
        ));
        *session = Some(Session {
            client,
            event_loop: handle,
        });

        info!(tenant = %self.tenant, host = %self.config.host, "Broker link connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);

        if let Err(e) = session.client.disconnect().await {
            debug!(tenant = %self.tenant, error = %e, "Disconnect request not delivered");
        }

        let mut handle = session.event_loop;
        if tokio::time::timeout(self.settings.shutdown_grace, &mut handle)
            .await
            .is_err()
        {
            warn!(tenant = %self.tenant, "Event loop did not stop in time, aborting");
            handle.abort();
        }

        info!(tenant = %self.tenant, "Broker link disconnected");
    }

    async fn publish(&self, event: &Event) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Ok(());
        }

        let Some(topic) = self.config.resolve_topic(&event.kind) else {
            trace!(tenant = %self.tenant, kind = %event.kind, "No topic for event, dropping");
            return Ok(());
        };

        let payload = codec::encode(event)?;
        let client = match self.session.lock().await.as_ref() {
            Some(session) => session.client.clone(),
            None => return Ok(()),
        };

        client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| LinkError::Client(e.to_string()))?;

        trace!(tenant = %self.tenant, topic = %topic, "Published event");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Creates [`MqttLink`]s.
#[derive(Debug, Clone, Default)]
pub struct MqttLinkFactory {
    settings: MqttSettings,
}

impl MqttLinkFactory {
    /// Create a factory with the given session settings.
    #[must_use]
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

impl LinkFactory for MqttLinkFactory {
    fn create(
        &self,
        tenant: &TenantKey,
        config: BrokerConfig,
        inbound: InboundSender,
    ) -> Arc<dyn BrokerLink> {
        Arc::new(MqttLink::new(
            tenant.clone(),
            config,
            self.settings.clone(),
            inbound,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::inbound_channel;
    use serde_json::json;

    fn link(config: BrokerConfig, settings: MqttSettings) -> MqttLink {
        let (tx, _rx) = inbound_channel(8);
        MqttLink::new(TenantKey::new("tenant-a"), config, settings, tx)
    }

    #[test]
    fn test_client_id_hides_key() {
        let settings = MqttSettings::default();
        let id = settings.client_id(&TenantKey::new("super-secret-key"));
        assert!(id.starts_with("relay-"));
        assert!(!id.contains("secret"));
        assert_eq!(id, settings.client_id(&TenantKey::new("super-secret-key")));
    }

    #[tokio::test]
    async fn test_publish_when_disconnected_is_noop() {
        let link = link(
            BrokerConfig::new("127.0.0.1", 1883).with_publish_topic("default"),
            MqttSettings::default(),
        );
        let event = Event::new("arrival", json!({}));

        assert!(!link.is_connected());
        assert!(link.publish(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = link(BrokerConfig::new("127.0.0.1", 1883), MqttSettings::default());
        link.disconnect().await;
        link.disconnect().await;
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_link_disconnected() {
        // Bind and drop to get a local port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = MqttSettings {
            connect_timeout: Duration::from_secs(2),
            ..MqttSettings::default()
        };
        let link = link(BrokerConfig::new("127.0.0.1", port), settings);

        assert!(link.connect().await.is_err());
        assert!(!link.is_connected());
    }
}
