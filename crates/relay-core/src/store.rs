//! Durable broker config storage.
//!
//! All tenants' configs live in one JSON document keyed by tenant key. The
//! document is read once at startup and rewritten whole on every change.

use crate::tenant::TenantKey;
use async_trait::async_trait;
use relay_protocol::BrokerConfig;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The medium could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config document could not be serialized.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where the config document lives.
///
/// Reads and writes always cover the whole document.
#[async_trait]
pub trait ConfigMedium: Send + Sync {
    /// Read the document. `None` means it does not exist yet.
    async fn read_all(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the document.
    async fn write_all(&self, document: &[u8]) -> Result<(), StoreError>;
}

/// A JSON file on local disk.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so readers never observe a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileMedium {
    path: PathBuf,
}

impl JsonFileMedium {
    /// Create a medium backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigMedium for JsonFileMedium {
    async fn read_all(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, document: &[u8]) -> Result<(), StoreError> {
        let temp = self.temp_path();
        tokio::fs::write(&temp, document).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// An in-process medium, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    document: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryMedium {
    /// Create an empty medium.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a medium holding `document`.
    #[must_use]
    pub fn with_document(document: impl Into<Vec<u8>>) -> Self {
        Self {
            document: Mutex::new(Some(document.into())),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The current document, if any.
    pub async fn document(&self) -> Option<Vec<u8>> {
        self.document.lock().await.clone()
    }
}

#[async_trait]
impl ConfigMedium for MemoryMedium {
    async fn read_all(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.document.lock().await.clone())
    }

    async fn write_all(&self, document: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                "writes disabled",
            )));
        }
        *self.document.lock().await = Some(document.to_vec());
        Ok(())
    }
}

/// Tenant key to broker config mapping, persisted through a [`ConfigMedium`].
pub struct BrokerConfigStore {
    medium: Arc<dyn ConfigMedium>,
    /// Held across the write so the document on disk follows memory order.
    configs: Mutex<HashMap<TenantKey, BrokerConfig>>,
}

impl BrokerConfigStore {
    /// Load the store from its medium.
    ///
    /// A missing or empty document yields an empty store. An unreadable or
    /// malformed document is logged and also yields an empty store; startup
    /// never fails here. Individual malformed entries are skipped.
    pub async fn load(medium: Arc<dyn ConfigMedium>) -> Self {
        let configs = match medium.read_all().await {
            Ok(Some(data)) => parse_document(&data),
            Ok(None) => {
                debug!("No broker config document, starting empty");
                HashMap::new()
            }
            Err(e) => {
                error!(error = %e, "Failed to read broker config document, starting empty");
                HashMap::new()
            }
        };

        info!(tenants = configs.len(), "Loaded broker configs");

        Self {
            medium,
            configs: Mutex::new(configs),
        }
    }

    /// Get a tenant's config.
    pub async fn get(&self, tenant: &TenantKey) -> Option<BrokerConfig> {
        self.configs.lock().await.get(tenant).cloned()
    }

    /// Replace a tenant's config and persist the whole mapping.
    ///
    /// The in-memory mapping is updated even if persisting fails, so a failure
    /// here means memory and the medium disagree until the next successful
    /// write.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be serialized or written.
    pub async fn set(&self, tenant: &TenantKey, config: BrokerConfig) -> Result<(), StoreError> {
        let mut configs = self.configs.lock().await;
        configs.insert(tenant.clone(), config);

        let document = render_document(&configs)?;
        if let Err(e) = self.medium.write_all(&document).await {
            error!(tenant = %tenant, error = %e, "Failed to persist broker configs");
            return Err(e);
        }

        debug!(tenant = %tenant, tenants = configs.len(), "Persisted broker configs");
        Ok(())
    }

    /// Number of tenants with a config.
    pub async fn len(&self) -> usize {
        self.configs.lock().await.len()
    }

    /// Check if no tenant has a config.
    pub async fn is_empty(&self) -> bool {
        self.configs.lock().await.is_empty()
    }
}

fn parse_document(data: &[u8]) -> HashMap<TenantKey, BrokerConfig> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return HashMap::new();
    }

    let entries: BTreeMap<String, Value> = match serde_json::from_slice(data) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Malformed broker config document, starting empty");
            return HashMap::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|(key, value)| {
            let tenant = TenantKey::from(key);
            match serde_json::from_value::<BrokerConfig>(value) {
                Ok(config) => Some((tenant, config)),
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "Skipping malformed broker config");
                    None
                }
            }
        })
        .collect()
}

fn render_document(configs: &HashMap<TenantKey, BrokerConfig>) -> Result<Vec<u8>, StoreError> {
    let sorted: BTreeMap<&str, &BrokerConfig> =
        configs.iter().map(|(k, v)| (k.as_str(), v)).collect();
    Ok(serde_json::to_vec_pretty(&sorted)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> BrokerConfig {
        BrokerConfig::new("broker.local", 1884)
            .with_credentials("robot", "s3cret")
            .with_subscribe_topic("robot/events")
            .with_publish_topic("robot/out")
            .with_type_topic("arrival", "robot/arrival")
            .with_type_topic("control", "robot/control")
    }

    fn temp_file(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("relay-{}-{}-{}.json", name, std::process::id(), nanos))
    }

    #[tokio::test]
    async fn test_missing_document_is_empty() {
        let store = BrokerConfigStore::load(Arc::new(MemoryMedium::new())).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_blank_document_is_empty() {
        let store = BrokerConfigStore::load(Arc::new(MemoryMedium::with_document("  \n"))).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_document_is_empty() {
        let medium = Arc::new(MemoryMedium::with_document("{not json"));
        let store = BrokerConfigStore::load(medium).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_skipped() {
        let medium = Arc::new(MemoryMedium::with_document(
            r#"{"good": {"host": "a"}, "bad": {"port": "nope"}}"#,
        ));
        let store = BrokerConfigStore::load(medium).await;

        assert_eq!(store.len().await, 1);
        assert!(store.get(&TenantKey::new("good")).await.is_some());
        assert!(store.get(&TenantKey::new("bad")).await.is_none());
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = BrokerConfigStore::load(Arc::new(MemoryMedium::new())).await;
        let tenant = TenantKey::new("tenant-a");

        store.set(&tenant, sample_config()).await.unwrap();
        assert_eq!(store.get(&tenant).await, Some(sample_config()));
    }

    #[tokio::test]
    async fn test_set_replaces_whole_config() {
        let store = BrokerConfigStore::load(Arc::new(MemoryMedium::new())).await;
        let tenant = TenantKey::new("tenant-a");

        store.set(&tenant, sample_config()).await.unwrap();
        let replacement = BrokerConfig::new("other", 1883);
        store.set(&tenant, replacement.clone()).await.unwrap();

        let stored = store.get(&tenant).await.unwrap();
        assert_eq!(stored, replacement);
        assert!(stored.topics_by_type.is_empty());
    }

    #[tokio::test]
    async fn test_set_persists_and_reloads() {
        let medium = Arc::new(MemoryMedium::new());
        let store = BrokerConfigStore::load(medium.clone()).await;
        let tenant = TenantKey::new("tenant-a");
        store.set(&tenant, sample_config()).await.unwrap();

        let reloaded = BrokerConfigStore::load(medium).await;
        assert_eq!(reloaded.get(&tenant).await, Some(sample_config()));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory() {
        let medium = Arc::new(MemoryMedium::new());
        medium.set_fail_writes(true);
        let store = BrokerConfigStore::load(medium.clone()).await;
        let tenant = TenantKey::new("tenant-a");

        assert!(store.set(&tenant, sample_config()).await.is_err());
        assert_eq!(store.get(&tenant).await, Some(sample_config()));
        assert!(medium.document().await.is_none());
    }

    #[tokio::test]
    async fn test_json_file_medium() {
        let path = temp_file("store");
        let medium = Arc::new(JsonFileMedium::new(&path));
        assert!(medium.read_all().await.unwrap().is_none());

        let store = BrokerConfigStore::load(medium.clone()).await;
        let tenant = TenantKey::new("tenant-a");
        store.set(&tenant, sample_config()).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"topics_by_type\""));

        let reloaded = BrokerConfigStore::load(medium).await;
        assert_eq!(reloaded.get(&tenant).await, Some(sample_config()));

        let _ = std::fs::remove_file(&path);
    }
}
