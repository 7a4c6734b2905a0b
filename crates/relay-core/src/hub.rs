//! Push-socket registry and fan-out.
//!
//! Sockets are grouped by tenant. Fan-out iterates a snapshot of the tenant's
//! sockets taken under the shard lock, sends with no lock held, then removes
//! the sockets that failed from the live set and closes them. Closing ends the
//! socket's own read loop, which then runs the normal close path.

use crate::tenant::TenantKey;
use dashmap::DashMap;
use relay_protocol::Event;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_transport::{SocketId, SocketSink, TransportError};
use tracing::{debug, info, trace, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single socket send.
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sockets that accepted the event.
    pub delivered: usize,
    /// Sockets that failed and were removed.
    pub failed: usize,
}

impl BroadcastReport {
    fn merge(&mut self, other: BroadcastReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

type SocketSet = HashMap<SocketId, Arc<dyn SocketSink>>;

/// Registry of live push sockets, grouped by tenant.
///
/// A tenant with no sockets has no entry.
pub struct SocketHub {
    tenants: DashMap<TenantKey, SocketSet>,
    config: HubConfig,
}

impl SocketHub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        Self {
            tenants: DashMap::new(),
            config,
        }
    }

    /// Admit a socket for a tenant.
    ///
    /// Returns the tenant's socket count after admission.
    pub fn admit(&self, tenant: &TenantKey, socket: Arc<dyn SocketSink>) -> usize {
        let id = socket.id().clone();
        let mut set = self.tenants.entry(tenant.clone()).or_default();
        set.insert(id.clone(), socket);
        let count = set.len();

        debug!(tenant = %tenant, socket = %id, sockets = count, "Socket admitted");
        count
    }

    /// Remove a socket.
    ///
    /// Returns the tenant's remaining socket count. The tenant's entry is
    /// dropped when it reaches zero.
    pub fn remove(&self, tenant: &TenantKey, socket: &SocketId) -> usize {
        let removed = self
            .tenants
            .get_mut(tenant)
            .map(|mut set| set.remove(socket).is_some())
            .unwrap_or(false);

        self.tenants.remove_if(tenant, |_, set| set.is_empty());
        let remaining = self.socket_count(tenant);

        if removed {
            debug!(tenant = %tenant, socket = %socket, sockets = remaining, "Socket removed");
        }
        remaining
    }

    /// Deliver an event to every socket of one tenant.
    ///
    /// A socket that fails (or exceeds the send timeout) is removed and
    /// closed; the rest still receive the event.
    pub async fn broadcast(&self, tenant: &TenantKey, event: &Event) -> BroadcastReport {
        let snapshot = self.snapshot(tenant);
        if snapshot.is_empty() {
            trace!(tenant = %tenant, kind = %event.kind, "No sockets for tenant");
            return BroadcastReport::default();
        }

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for socket in &snapshot {
            match self.deliver(socket.as_ref(), event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(tenant = %tenant, socket = %socket.id(), error = %e, "Delivery failed, dropping socket");
                    failed.push(socket.clone());
                }
            }
        }

        for socket in &failed {
            self.remove(tenant, socket.id());
            self.evict(socket.as_ref()).await;
        }
        report.failed = failed.len();

        trace!(
            tenant = %tenant,
            kind = %event.kind,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );
        report
    }

    /// Deliver an event to every socket of every tenant.
    pub async fn broadcast_all(&self, event: &Event) -> BroadcastReport {
        let tenants = self.tenants();
        info!(tenants = tenants.len(), kind = %event.kind, "Broadcasting to all tenants");

        let mut report = BroadcastReport::default();
        for tenant in &tenants {
            report.merge(self.broadcast(tenant, event).await);
        }
        report
    }

    async fn deliver(&self, socket: &dyn SocketSink, event: &Event) -> Result<(), TransportError> {
        match tokio::time::timeout(self.config.send_timeout, socket.send(event)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn evict(&self, socket: &dyn SocketSink) {
        match tokio::time::timeout(self.config.send_timeout, socket.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(socket = %socket.id(), error = %e, "Close after failed delivery"),
            Err(_) => debug!(socket = %socket.id(), "Close timed out after failed delivery"),
        }
    }

    fn snapshot(&self, tenant: &TenantKey) -> Vec<Arc<dyn SocketSink>> {
        self.tenants
            .get(tenant)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tenants that currently have sockets.
    #[must_use]
    pub fn tenants(&self) -> Vec<TenantKey> {
        self.tenants.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of sockets a tenant has.
    #[must_use]
    pub fn socket_count(&self, tenant: &TenantKey) -> usize {
        self.tenants.get(tenant).map(|set| set.len()).unwrap_or(0)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            tenant_count: self.tenants.len(),
            socket_count: self.tenants.iter().map(|e| e.len()).sum(),
        }
    }
}

impl Default for SocketHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    /// Tenants with at least one socket.
    pub tenant_count: usize,
    /// Total admitted sockets.
    pub socket_count: usize,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A socket that records what it receives.
    pub(crate) struct RecordingSocket {
        id: SocketId,
        received: Mutex<Vec<Event>>,
        fail: AtomicBool,
        stall: AtomicBool,
        closes: AtomicUsize,
    }

    impl RecordingSocket {
        pub(crate) fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: SocketId::new(id),
                received: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                stall: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn failing(id: &str) -> Arc<Self> {
            let socket = Self::new(id);
            socket.fail.store(true, Ordering::SeqCst);
            socket
        }

        pub(crate) fn stalling(id: &str) -> Arc<Self> {
            let socket = Self::new(id);
            socket.start_stalling();
            socket
        }

        /// Make every later send hang.
        pub(crate) fn start_stalling(&self) {
            self.stall.store(true, Ordering::SeqCst);
        }

        pub(crate) fn close_calls(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub(crate) fn received(&self) -> Vec<Event> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SocketSink for RecordingSocket {
        fn id(&self) -> &SocketId {
            &self.id
        }

        async fn send(&self, event: &Event) -> Result<(), TransportError> {
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::SocketClosed);
            }
            self.received.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.fail.load(Ordering::SeqCst)
        }
    }

    fn event() -> Event {
        Event::new("arrival", json!({"robot": "r-1"}))
    }

    #[test]
    fn test_admit_remove_drops_empty_tenant() {
        let hub = SocketHub::new();
        let tenant = TenantKey::new("tenant-a");

        assert_eq!(hub.admit(&tenant, RecordingSocket::new("s1")), 1);
        assert_eq!(hub.admit(&tenant, RecordingSocket::new("s2")), 2);

        assert_eq!(hub.remove(&tenant, &SocketId::new("s1")), 1);
        assert_eq!(hub.stats().tenant_count, 1);

        assert_eq!(hub.remove(&tenant, &SocketId::new("s2")), 0);
        assert_eq!(hub.stats().tenant_count, 0);
    }

    #[test]
    fn test_remove_unknown_socket() {
        let hub = SocketHub::new();
        let tenant = TenantKey::new("tenant-a");

        assert_eq!(hub.remove(&tenant, &SocketId::new("missing")), 0);
        assert_eq!(hub.stats().tenant_count, 0);
    }

    #[tokio::test]
    async fn test_broadcast_is_tenant_scoped() {
        let hub = SocketHub::new();
        let a = RecordingSocket::new("a");
        let b = RecordingSocket::new("b");
        hub.admit(&TenantKey::new("tenant-a"), a.clone());
        hub.admit(&TenantKey::new("tenant-b"), b.clone());

        let report = hub.broadcast(&TenantKey::new("tenant-a"), &event()).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(a.received().len(), 1);
        assert!(b.received().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failed_socket() {
        let hub = SocketHub::new();
        let tenant = TenantKey::new("tenant-a");
        let s1 = RecordingSocket::new("s1");
        let bad = RecordingSocket::failing("bad");
        let s3 = RecordingSocket::new("s3");
        hub.admit(&tenant, s1.clone());
        hub.admit(&tenant, bad.clone());
        hub.admit(&tenant, s3.clone());

        let report = hub.broadcast(&tenant, &event()).await;

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(s1.received(), vec![event()]);
        assert_eq!(s3.received(), vec![event()]);
        assert_eq!(hub.socket_count(&tenant), 2);
        assert_eq!(bad.close_calls(), 1);
        assert_eq!(s1.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_last_socket_failure_drops_tenant() {
        let hub = SocketHub::new();
        let tenant = TenantKey::new("tenant-a");
        hub.admit(&tenant, RecordingSocket::failing("bad"));

        let report = hub.broadcast(&tenant, &event()).await;

        assert_eq!(report.failed, 1);
        assert_eq!(hub.stats().tenant_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_times_out_stalled_socket() {
        let hub = SocketHub::with_config(HubConfig {
            send_timeout: Duration::from_millis(100),
        });
        let tenant = TenantKey::new("tenant-a");
        let ok = RecordingSocket::new("ok");
        let stalled = RecordingSocket::stalling("stalled");
        hub.admit(&tenant, stalled.clone());
        hub.admit(&tenant, ok.clone());

        let report = hub.broadcast(&tenant, &event()).await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(ok.received().len(), 1);
        assert_eq!(hub.socket_count(&tenant), 1);
        assert_eq!(stalled.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_socket() {
        let hub = SocketHub::new();
        let tenant = TenantKey::new("tenant-a");
        let socket = RecordingSocket::new("s1");
        hub.admit(&tenant, socket.clone());

        for i in 0..5 {
            hub.broadcast(&tenant, &Event::new("status", json!({ "seq": i })))
                .await;
        }

        let seqs: Vec<i64> = socket
            .received()
            .iter()
            .map(|e| e.data["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_broadcast_all() {
        let hub = SocketHub::new();
        let a = RecordingSocket::new("a");
        let b = RecordingSocket::new("b");
        hub.admit(&TenantKey::new("tenant-a"), a.clone());
        hub.admit(&TenantKey::new("tenant-b"), b.clone());

        let report = hub.broadcast_all(&event()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(a.received().len(), 1);
        assert_eq!(b.received().len(), 1);
    }

    #[test]
    fn test_hub_stats() {
        let hub = SocketHub::new();
        hub.admit(&TenantKey::new("tenant-a"), RecordingSocket::new("s1"));
        hub.admit(&TenantKey::new("tenant-a"), RecordingSocket::new("s2"));
        hub.admit(&TenantKey::new("tenant-b"), RecordingSocket::new("s3"));

        let stats = hub.stats();
        assert_eq!(stats.tenant_count, 2);
        assert_eq!(stats.socket_count, 3);
    }
}
