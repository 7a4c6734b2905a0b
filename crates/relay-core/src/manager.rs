//! Tenant broker link lifecycle.
//!
//! Each tenant gets one slot guarded by an async mutex. Every operation that
//! creates, replaces or tears down the tenant's link holds that slot for its
//! whole duration, so there is never more than one link per tenant and
//! overlapping reconfigurations apply in lock order.
//!
//! Readers on the event path never take a slot. They see the installed links
//! through a separate map that is only written while the slot is held, so a
//! submit never waits behind a slow broker connect.

use crate::link::{BrokerLink, InboundSender, LinkFactory};
use crate::store::{BrokerConfigStore, StoreError};
use crate::tenant::TenantKey;
use dashmap::DashMap;
use relay_protocol::{BrokerConfig, LinkStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reconfiguration errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The config could not be persisted. Memory holds the new config.
    #[error("Failed to persist broker config: {0}")]
    Persist(#[from] StoreError),

    /// The config was saved but the new link did not come up.
    #[error("Config saved but broker connection failed: {0}")]
    Connect(String),
}

type Slot = Arc<Mutex<Option<Arc<dyn BrokerLink>>>>;

/// Owns every tenant's broker link.
pub struct TenantConnectionManager {
    store: Arc<BrokerConfigStore>,
    factory: Arc<dyn LinkFactory>,
    inbound: InboundSender,
    /// Slots are never removed, so two callers always contend on the same lock.
    slots: DashMap<TenantKey, Slot>,
    /// Mirror of each slot's link, written under that slot's lock.
    installed: DashMap<TenantKey, Arc<dyn BrokerLink>>,
}

impl TenantConnectionManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        store: Arc<BrokerConfigStore>,
        factory: Arc<dyn LinkFactory>,
        inbound: InboundSender,
    ) -> Self {
        Self {
            store,
            factory,
            inbound,
            slots: DashMap::new(),
            installed: DashMap::new(),
        }
    }

    fn slot(&self, tenant: &TenantKey) -> Slot {
        self.slots.entry(tenant.clone()).or_default().clone()
    }

    fn existing_slot(&self, tenant: &TenantKey) -> Option<Slot> {
        self.slots.get(tenant).map(|slot| slot.clone())
    }

    /// Replace the slot's link. The caller holds the slot lock.
    fn install(
        &self,
        tenant: &TenantKey,
        current: &mut Option<Arc<dyn BrokerLink>>,
        link: Option<Arc<dyn BrokerLink>>,
    ) -> Option<Arc<dyn BrokerLink>> {
        match &link {
            Some(link) => {
                self.installed.insert(tenant.clone(), link.clone());
            }
            None => {
                self.installed.remove(tenant);
            }
        }
        std::mem::replace(current, link)
    }

    /// Make sure the tenant has a connected link, if it has a config.
    ///
    /// Idempotent. A tenant without a config is left alone. Connect failures
    /// are logged and reported through the returned status only; the next call
    /// tries again.
    pub async fn ensure_connection(&self, tenant: &TenantKey) -> LinkStatus {
        let slot = self.slot(tenant);
        let mut current = slot.lock().await;
        self.ensure_locked(tenant, &mut current).await
    }

    async fn ensure_locked(
        &self,
        tenant: &TenantKey,
        current: &mut Option<Arc<dyn BrokerLink>>,
    ) -> LinkStatus {
        if current.as_ref().is_some_and(|link| link.is_connected()) {
            return LinkStatus::Connected;
        }
        if let Some(stale) = self.install(tenant, current, None) {
            debug!(tenant = %tenant, "Replacing stale broker link");
            stale.disconnect().await;
        }

        let Some(config) = self.store.get(tenant).await else {
            debug!(tenant = %tenant, "No broker config, skipping link");
            return LinkStatus::NotConfigured;
        };

        info!(tenant = %tenant, host = %config.host, "Establishing broker link");
        let link = self.factory.create(tenant, config, self.inbound.clone());
        match link.connect().await {
            Ok(()) => {
                self.install(tenant, current, Some(link));
                LinkStatus::Connected
            }
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Broker link failed to connect");
                LinkStatus::Error(e.to_string())
            }
        }
    }

    /// Replace a tenant's config and reconnect under it.
    ///
    /// The config is persisted first, then any existing link is torn down and
    /// a fresh one is connected. On connect failure the config stays saved and
    /// the tenant is left without a link.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails or the new link does not connect.
    pub async fn set_config(
        &self,
        tenant: &TenantKey,
        config: BrokerConfig,
    ) -> Result<(), ManagerError> {
        let slot = self.slot(tenant);
        let mut current = slot.lock().await;

        self.store.set(tenant, config).await?;

        if let Some(old) = self.install(tenant, &mut current, None) {
            debug!(tenant = %tenant, "Tearing down link for reconfiguration");
            old.disconnect().await;
        }

        match self.ensure_locked(tenant, &mut current).await {
            LinkStatus::Connected => Ok(()),
            LinkStatus::Error(detail) => Err(ManagerError::Connect(detail)),
            other => Err(ManagerError::Connect(other.to_string())),
        }
    }

    /// Get a tenant's config.
    pub async fn get_config(&self, tenant: &TenantKey) -> Option<BrokerConfig> {
        self.store.get(tenant).await
    }

    /// Tear down and forget a tenant's link. Idempotent.
    pub async fn disconnect_tenant(&self, tenant: &TenantKey) {
        self.disconnect_tenant_if(tenant, || true).await;
    }

    /// Tear down a tenant's link if `still_idle` holds once the slot is held.
    ///
    /// Returns `true` if a link was torn down.
    pub async fn disconnect_tenant_if<F>(&self, tenant: &TenantKey, still_idle: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let Some(slot) = self.existing_slot(tenant) else {
            return false;
        };
        let mut current = slot.lock().await;

        if !still_idle() {
            debug!(tenant = %tenant, "Tenant became active again, keeping link");
            return false;
        }

        match self.install(tenant, &mut current, None) {
            Some(link) => {
                link.disconnect().await;
                info!(tenant = %tenant, "Broker link torn down");
                true
            }
            None => false,
        }
    }

    /// Get a tenant's installed link.
    ///
    /// Does not wait for a connect in progress; a link only shows up here
    /// once it has connected.
    #[must_use]
    pub fn get_link(&self, tenant: &TenantKey) -> Option<Arc<dyn BrokerLink>> {
        self.installed.get(tenant).map(|link| link.clone())
    }

    /// Describe a tenant's link state without changing it.
    pub async fn link_status(&self, tenant: &TenantKey) -> LinkStatus {
        if self.get_link(tenant).is_some_and(|link| link.is_connected()) {
            return LinkStatus::Connected;
        }
        if self.store.get(tenant).await.is_some() {
            LinkStatus::Disconnected
        } else {
            LinkStatus::NotConfigured
        }
    }

    /// Tear down every link.
    pub async fn shutdown(&self) {
        let tenants: Vec<TenantKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for tenant in &tenants {
            self.disconnect_tenant(tenant).await;
        }
        info!(tenants = tenants.len(), "All broker links shut down");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::{inbound_channel, LinkError, LinkEvent};
    use crate::store::MemoryMedium;
    use async_trait::async_trait;
    use relay_protocol::Event;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Counters shared by a mock factory and the links it creates.
    #[derive(Default)]
    pub(crate) struct MockBroker {
        pub(crate) connects: AtomicUsize,
        pub(crate) live: AtomicUsize,
        pub(crate) fail: AtomicBool,
        /// Makes every connect take seconds instead of milliseconds.
        pub(crate) slow: AtomicBool,
        pub(crate) published: StdMutex<Vec<(String, Event)>>,
        inbound: StdMutex<Option<InboundSender>>,
    }

    impl MockBroker {
        /// Simulate the broker delivering a message to the most recent link.
        pub(crate) fn deliver(&self, tenant: &TenantKey, payload: &'static [u8]) -> bool {
            let inbound = self.inbound.lock().unwrap().clone();
            inbound.is_some_and(|tx| {
                tx.offer(LinkEvent::Message {
                    tenant: tenant.clone(),
                    topic: "robot/events".to_string(),
                    payload: bytes::Bytes::from_static(payload),
                })
            })
        }
    }

    struct MockLink {
        tenant: TenantKey,
        config: BrokerConfig,
        broker: Arc<MockBroker>,
        connected: AtomicBool,
    }

    #[async_trait]
    impl BrokerLink for MockLink {
        fn tenant(&self) -> &TenantKey {
            &self.tenant
        }

        fn config(&self) -> &BrokerConfig {
            &self.config
        }

        async fn connect(&self) -> Result<(), LinkError> {
            self.broker.connects.fetch_add(1, Ordering::SeqCst);
            let delay = if self.broker.slow.load(Ordering::SeqCst) {
                Duration::from_secs(3)
            } else {
                Duration::from_millis(20)
            };
            tokio::time::sleep(delay).await;
            if self.broker.fail.load(Ordering::SeqCst) {
                return Err(LinkError::Connect("connection refused".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            self.broker.live.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            if self.connected.swap(false, Ordering::SeqCst) {
                self.broker.live.fetch_sub(1, Ordering::SeqCst);
            }
        }

        async fn publish(&self, event: &Event) -> Result<(), LinkError> {
            if !self.is_connected() {
                return Ok(());
            }
            if let Some(topic) = self.config.resolve_topic(&event.kind) {
                self.broker
                    .published
                    .lock()
                    .unwrap()
                    .push((topic.to_string(), event.clone()));
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct MockFactory {
        pub(crate) broker: Arc<MockBroker>,
    }

    impl LinkFactory for MockFactory {
        fn create(
            &self,
            tenant: &TenantKey,
            config: BrokerConfig,
            inbound: InboundSender,
        ) -> Arc<dyn BrokerLink> {
            *self.broker.inbound.lock().unwrap() = Some(inbound);
            Arc::new(MockLink {
                tenant: tenant.clone(),
                config,
                broker: self.broker.clone(),
                connected: AtomicBool::new(false),
            })
        }
    }

    pub(crate) async fn manager_with(
        configs: &[(&str, BrokerConfig)],
    ) -> (
        Arc<TenantConnectionManager>,
        Arc<MockBroker>,
        mpsc::Receiver<LinkEvent>,
    ) {
        let store = Arc::new(BrokerConfigStore::load(Arc::new(MemoryMedium::new())).await);
        for (tenant, config) in configs {
            store.set(&TenantKey::new(tenant), config.clone()).await.unwrap();
        }
        let broker = Arc::new(MockBroker::default());
        let factory = Arc::new(MockFactory {
            broker: broker.clone(),
        });
        let (tx, rx) = inbound_channel(16);
        let manager = Arc::new(TenantConnectionManager::new(store, factory, tx));
        (manager, broker, rx)
    }

    pub(crate) fn config(host: &str) -> BrokerConfig {
        BrokerConfig::new(host, 1883)
            .with_publish_topic("default")
            .with_type_topic("arrival", "x/y")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_connects_once() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("a"))]).await;
        let tenant = TenantKey::new("tenant-a");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move { manager.ensure_connection(&tenant).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), LinkStatus::Connected);
        }
        assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
        assert_eq!(broker.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_without_config_is_noop() {
        let (manager, broker, _rx) = manager_with(&[]).await;
        let tenant = TenantKey::new("tenant-a");

        assert_eq!(manager.ensure_connection(&tenant).await, LinkStatus::NotConfigured);
        assert_eq!(broker.connects.load(Ordering::SeqCst), 0);
        assert!(manager.get_link(&tenant).is_none());
    }

    #[tokio::test]
    async fn test_ensure_failure_is_swallowed_and_retried() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("a"))]).await;
        let tenant = TenantKey::new("tenant-a");
        broker.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            manager.ensure_connection(&tenant).await,
            LinkStatus::Error(_)
        ));
        assert!(manager.get_link(&tenant).is_none());
        assert_eq!(manager.link_status(&tenant).await, LinkStatus::Disconnected);

        broker.fail.store(false, Ordering::SeqCst);
        assert_eq!(manager.ensure_connection(&tenant).await, LinkStatus::Connected);
        assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_set_config_roundtrip_and_connects() {
        let (manager, broker, _rx) = manager_with(&[]).await;
        let tenant = TenantKey::new("tenant-a");
        let cfg = config("a").with_type_topic("control", "robot/control");

        manager.set_config(&tenant, cfg.clone()).await.unwrap();

        assert_eq!(manager.get_config(&tenant).await, Some(cfg.clone()));
        let link = manager.get_link(&tenant).unwrap();
        assert_eq!(link.config(), &cfg);
        assert_eq!(broker.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_config_replaces_existing_link() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("old"))]).await;
        let tenant = TenantKey::new("tenant-a");
        manager.ensure_connection(&tenant).await;

        manager.set_config(&tenant, config("new")).await.unwrap();

        assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
        assert_eq!(broker.live.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_link(&tenant).unwrap().config().host, "new");
    }

    #[tokio::test]
    async fn test_set_config_connect_failure_keeps_config() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("old"))]).await;
        let tenant = TenantKey::new("tenant-a");
        manager.ensure_connection(&tenant).await;
        broker.fail.store(true, Ordering::SeqCst);

        let result = manager.set_config(&tenant, config("new")).await;

        assert!(matches!(result, Err(ManagerError::Connect(_))));
        assert_eq!(manager.get_config(&tenant).await.unwrap().host, "new");
        assert!(manager.get_link(&tenant).is_none());
        assert_eq!(broker.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_set_config_leaves_one_link() {
        let (manager, broker, _rx) = manager_with(&[]).await;
        let tenant = TenantKey::new("tenant-a");

        let a = {
            let manager = manager.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move { manager.set_config(&tenant, config("a")).await })
        };
        let b = {
            let manager = manager.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move { manager.set_config(&tenant, config("b")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(broker.live.load(Ordering::SeqCst), 1);
        let stored = manager.get_config(&tenant).await.unwrap();
        let link = manager.get_link(&tenant).unwrap();
        assert!(link.is_connected());
        assert_eq!(link.config(), &stored);
    }

    #[tokio::test]
    async fn test_disconnect_tenant_is_idempotent() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("a"))]).await;
        let tenant = TenantKey::new("tenant-a");
        manager.ensure_connection(&tenant).await;

        manager.disconnect_tenant(&tenant).await;
        manager.disconnect_tenant(&tenant).await;
        manager.disconnect_tenant(&TenantKey::new("unknown")).await;

        assert!(manager.get_link(&tenant).is_none());
        assert_eq!(broker.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_if_respects_predicate() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("a"))]).await;
        let tenant = TenantKey::new("tenant-a");
        manager.ensure_connection(&tenant).await;

        assert!(!manager.disconnect_tenant_if(&tenant, || false).await);
        assert_eq!(broker.live.load(Ordering::SeqCst), 1);

        assert!(manager.disconnect_tenant_if(&tenant, || true).await);
        assert_eq!(broker.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_link_is_replaced() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("a"))]).await;
        let tenant = TenantKey::new("tenant-a");
        manager.ensure_connection(&tenant).await;

        // Simulate the broker dropping the session.
        manager.get_link(&tenant).unwrap().disconnect().await;

        assert_eq!(manager.ensure_connection(&tenant).await, LinkStatus::Connected);
        assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
        assert_eq!(broker.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_link_does_not_wait_for_connect() {
        let (manager, broker, _rx) = manager_with(&[("tenant-a", config("a"))]).await;
        let tenant = TenantKey::new("tenant-a");
        broker.slow.store(true, Ordering::SeqCst);

        let connecting = {
            let manager = manager.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move { manager.ensure_connection(&tenant).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connects.load(Ordering::SeqCst), 1);

        assert!(manager.get_link(&tenant).is_none());
        let status = tokio::time::timeout(Duration::from_millis(50), manager.link_status(&tenant))
            .await
            .unwrap();
        assert_eq!(status, LinkStatus::Disconnected);

        assert_eq!(connecting.await.unwrap(), LinkStatus::Connected);
        assert!(manager.get_link(&tenant).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_all() {
        let (manager, broker, _rx) =
            manager_with(&[("tenant-a", config("a")), ("tenant-b", config("b"))]).await;
        manager.ensure_connection(&TenantKey::new("tenant-a")).await;
        manager.ensure_connection(&TenantKey::new("tenant-b")).await;
        assert_eq!(broker.live.load(Ordering::SeqCst), 2);

        manager.shutdown().await;
        assert_eq!(broker.live.load(Ordering::SeqCst), 0);
    }
}
