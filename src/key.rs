//! Cache key and value model.
//!
//! A [`CacheKey`] is `namespace:key[:v<version>]`; when the rendered key
//! exceeds the 250-byte wire limit the stable form becomes
//! `namespace:hash:<md5-hex>`. Equality and hashing are defined over that
//! stable form, so a long key and its digest form compare equal across
//! tiers. The digest is not security-bearing.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Longest full key stored verbatim; longer keys switch to the digest form.
const MAX_PLAIN_KEY_BYTES: usize = 250;

/// Glob match helper shared by key patterns, middleware path rules and CORS
/// wildcard origins. A bare `*` always matches; invalid patterns match
/// nothing.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    globset::Glob::new(pattern)
        .map(|glob| glob.compile_matcher().is_match(text))
        .unwrap_or(false)
}

/// Namespaced cache key with optional version and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKey {
    namespace: String,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

impl CacheKey {
    /// Create a key. Namespace and key must be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] when either part is empty.
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Result<Self, CacheError> {
        let namespace = namespace.into();
        let key = key.into();
        if namespace.is_empty() {
            return Err(CacheError::InvalidKey("namespace must not be empty".into()));
        }
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".into()));
        }
        Ok(Self {
            namespace,
            key,
            version: None,
            tags: Vec::new(),
        })
    }

    /// Attach a version; it becomes the `:v<version>` suffix of the full key.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Attach routing tags (not part of the key identity).
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Derive a key with `:<suffix>` appended to the key part.
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            namespace: self.namespace.clone(),
            key: format!("{}:{suffix}", self.key),
            version: self.version.clone(),
            tags: self.tags.clone(),
        }
    }

    /// Derive a key with `<prefix>:` prepended to the key part.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            namespace: self.namespace.clone(),
            key: format!("{prefix}:{}", self.key),
            version: self.version.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Rendered key: `namespace:key[:v<version>]`.
    #[must_use]
    pub fn full_key(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}:v{version}", self.namespace, self.key),
            None => format!("{}:{}", self.namespace, self.key),
        }
    }

    /// Stable storage key. Falls back to `namespace:hash:<md5-hex>` when the
    /// full key exceeds the wire limit.
    #[must_use]
    pub fn hash_key(&self) -> String {
        let full = self.full_key();
        if full.len() > MAX_PLAIN_KEY_BYTES {
            let digest = md5::compute(full.as_bytes());
            format!("{}:hash:{digest:x}", self.namespace)
        } else {
            full
        }
    }

    /// Glob match against the full key (`*`, `?`, `[..]`).
    #[must_use]
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        glob_match(pattern, &self.full_key())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash_key() == other.hash_key()
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_key().hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hash_key())
    }
}

/// Opaque payload plus lifecycle metadata.
///
/// A value whose `expires_at` has passed is never handed to a reader: tiers
/// synthesize a miss and may drop the entry on sight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheValue {
    /// Payload bytes, opaque to the fabric.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub size_bytes: usize,
    pub metadata: HashMap<String, String>,
}

impl CacheValue {
    /// Wrap payload bytes; no expiration.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size_bytes = data.len();
        Self {
            data,
            created_at: Utc::now(),
            expires_at: None,
            access_count: 0,
            last_accessed: None,
            size_bytes,
            metadata: HashMap::new(),
        }
    }

    /// Wrap payload bytes with an absolute expiry `ttl` from now.
    #[must_use]
    pub fn with_ttl(data: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        let mut value = Self::new(data);
        value.expires_at = Some(Utc::now() + ttl);
        value
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Remaining time to live; `None` when the value never expires,
    /// `Some(ZERO)` when already expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at.map(|at| {
            (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Time since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Record an access (monotonic count plus last-access stamp).
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
    }

    /// Push the expiry `ttl` from now.
    pub fn extend_ttl(&mut self, ttl: Duration) {
        self.expires_at = Some(Utc::now() + ttl);
    }
}

/// Store-internal pairing of a key and its value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: CacheValue,
}

impl CacheEntry {
    #[must_use]
    pub fn new(key: CacheKey, value: CacheValue) -> Self {
        Self { key, value }
    }
}
