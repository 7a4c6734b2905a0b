//! Tenant and admin key registry.
//!
//! Tenant keys live in a line-based file, one key per line. The admin master
//! key comes from configuration; when it is empty admin routes are disabled.

use dashmap::DashSet;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tenvis_relay_core::TenantKey;
use tracing::{info, warn};

/// Known tenant keys plus the admin master key.
#[derive(Debug)]
pub struct KeyRegistry {
    path: PathBuf,
    master_key: String,
    keys: DashSet<String>,
}

impl KeyRegistry {
    /// Open the key file, creating it empty if missing, and load it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or read.
    pub async fn open(path: impl Into<PathBuf>, master_key: impl Into<String>) -> io::Result<Self> {
        let path = path.into();
        let master_key = master_key.into();

        if master_key.is_empty() {
            warn!("Master key is empty, admin functions are disabled");
        }

        if tokio::fs::metadata(&path).await.is_err() {
            info!(path = %path.display(), "Key file not found, creating an empty one");
            tokio::fs::write(&path, b"").await?;
        }

        let registry = Self {
            path,
            master_key,
            keys: DashSet::new(),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Re-read the key file.
    ///
    /// Keys present both before and after stay valid throughout.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read; the current keys are kept.
    pub async fn reload(&self) -> io::Result<usize> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let fresh = parse_keys(&contents);

        self.keys.retain(|key| fresh.contains(key));
        for key in fresh {
            self.keys.insert(key);
        }

        let count = self.keys.len();
        info!(path = %self.path.display(), keys = count, "Tenant keys loaded");
        Ok(count)
    }

    /// Resolve a token to a tenant if it is a known key.
    #[must_use]
    pub fn tenant(&self, token: &str) -> Option<TenantKey> {
        self.is_valid_tenant_key(token).then(|| TenantKey::new(token))
    }

    /// Check a tenant key.
    #[must_use]
    pub fn is_valid_tenant_key(&self, key: &str) -> bool {
        !key.is_empty() && self.keys.contains(key)
    }

    /// Check the admin master key. Always false when admin is disabled.
    #[must_use]
    pub fn is_valid_admin_key(&self, key: &str) -> bool {
        !self.master_key.is_empty() && key == self.master_key
    }

    /// Number of known tenant keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if there are no tenant keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Path of the key file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_keys(contents: &str) -> HashSet<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
