//! Tenant identity.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Number of leading key characters shown in logs.
const VISIBLE_PREFIX: usize = 5;

/// An opaque tenant API key.
///
/// Keys are supplied and validated by the auth layer; this type only carries
/// them. `Display` shows a short prefix so keys can be logged safely; use
/// [`TenantKey::as_str`] when the full key is needed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey(Arc<str>);

impl TenantKey {
    /// Wrap a key.
    #[must_use]
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The full key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key with everything after the first few characters hidden.
    #[must_use]
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
        format!("{}...", prefix)
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantKey({})", self.redacted())
    }
}

impl Borrow<str> for TenantKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hides_key() {
        let key = TenantKey::new("abcdefghijkl");
        assert_eq!(key.to_string(), "abcde...");
        assert_eq!(format!("{:?}", key), "TenantKey(abcde...)");
        assert_eq!(key.as_str(), "abcdefghijkl");
    }

    #[test]
    fn test_short_key() {
        assert_eq!(TenantKey::new("ab").redacted(), "ab...");
    }
}
