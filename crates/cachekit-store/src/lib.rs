//! # CacheKit Store
//!
//! Named request/response stores for the CacheKit offline-cache runtime.
//!
//! ## Features
//!
//! - **Named stores**: one store per cache generation, created and deleted
//!   by the owning worker
//! - **Request keys**: entries keyed by request method plus URL
//! - **Last-write-wins puts**: concurrent writes to the same key resolve to
//!   whichever completes last
//! - **Cross-store lookup**: a single match across every live store
//!
//! ## Architecture
//!
//! ```text
//! StoreRegistry (owned by the worker, shared across instances)
//!     │
//!     ├── Store "shell-<version>"
//!     │       └── RequestKey → StoreEntry
//!     │
//!     └── Store "assets"
//!             └── RequestKey → StoreEntry
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

// ==================== Errors ====================

/// Errors that can occur in store operations.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("no store named {0}")]
    NotFound(String),
}

// ==================== Request Key ====================

/// Identity of a cached request: its method plus its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    /// Create a key from a request's method and URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// The request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Store Entry ====================

/// A persisted response, keyed by the request that produced it.
///
/// Only entries produced by a successful, cacheable fetch are persisted;
/// the policy deciding that lives with the worker, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Key of the request that produced this entry.
    pub key: RequestKey,

    /// Response status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Milliseconds since the epoch at store time.
    pub stored_at: u64,
}

impl StoreEntry {
    /// Create an entry stamped with the current time.
    pub fn new(key: RequestKey, status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        let stored_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            key,
            status,
            headers,
            body,
            stored_at,
        }
    }
}

// ==================== Store ====================

/// A single named store of request → response entries.
#[derive(Debug, Default)]
pub struct Store {
    name: String,
    entries: HashMap<RequestKey, StoreEntry>,
}

impl Store {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an entry by request key.
    pub fn lookup(&self, key: &RequestKey) -> Option<&StoreEntry> {
        self.entries.get(key)
    }

    /// Insert an entry, replacing any entry with the same key.
    pub fn insert(&mut self, entry: StoreEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Remove an entry. Returns whether one existed.
    pub fn remove(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys currently in the store.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries.keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Store Registry ====================

/// The set of named stores for one origin.
///
/// Cloning is cheap and shares the underlying stores; the registry outlives
/// any single worker instance, which is how cached entries survive worker
/// restarts until a newer instance deletes their store.
#[derive(Debug, Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<RwLock<HashMap<String, Store>>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store, creating it if it does not exist.
    pub async fn open(&self, name: &str) {
        let mut stores = self.stores.write().await;
        if !stores.contains_key(name) {
            trace!(store = %name, "creating store");
            stores.insert(name.to_string(), Store::new(name));
        }
    }

    /// Whether a store with this name exists.
    pub async fn has(&self, name: &str) -> bool {
        self.stores.read().await.contains_key(name)
    }

    /// Names of all live stores.
    pub async fn names(&self) -> Vec<String> {
        self.stores.read().await.keys().cloned().collect()
    }

    /// Delete a whole store. Returns whether one existed.
    pub async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.stores.write().await.remove(name).is_some();
        if removed {
            trace!(store = %name, "deleted store");
        }
        Ok(removed)
    }

    /// Insert an entry into a named store.
    ///
    /// The store must already exist; the worker creates stores explicitly
    /// during install, and a write-back never targets anything else.
    pub async fn insert_into(&self, name: &str, entry: StoreEntry) -> Result<(), StoreError> {
        let mut stores = self.stores.write().await;
        let store = stores
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        trace!(store = %name, key = %entry.key, "stored entry");
        store.insert(entry);
        Ok(())
    }

    /// Look up a key in one named store.
    pub async fn lookup_in(&self, name: &str, key: &RequestKey) -> Option<StoreEntry> {
        self.stores.read().await.get(name)?.lookup(key).cloned()
    }

    /// Look up a key across every live store.
    pub async fn lookup(&self, key: &RequestKey) -> Option<StoreEntry> {
        let stores = self.stores.read().await;
        for store in stores.values() {
            if let Some(entry) = store.lookup(key) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Number of entries in a named store, if it exists.
    pub async fn entry_count(&self, name: &str) -> Option<usize> {
        self.stores.read().await.get(name).map(Store::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(method: &str, url: &str, body: &[u8]) -> StoreEntry {
        StoreEntry::new(
            RequestKey::new(method, url),
            200,
            HashMap::new(),
            body.to_vec(),
        )
    }

    #[test]
    fn test_request_key_normalizes_method() {
        let key = RequestKey::new("get", "https://app.example/a.js");
        assert_eq!(key.method(), "GET");
        assert_eq!(key.to_string(), "GET https://app.example/a.js");
    }

    #[test]
    fn test_store_insert_and_lookup() {
        let mut store = Store::new("shell-v1");
        store.insert(entry("GET", "https://app.example/a.js", b"alpha"));

        let key = RequestKey::new("GET", "https://app.example/a.js");
        assert_eq!(store.lookup(&key).unwrap().body, b"alpha");
        assert!(store
            .lookup(&RequestKey::new("GET", "https://app.example/b.js"))
            .is_none());
    }

    #[test]
    fn test_store_last_write_wins() {
        let mut store = Store::new("shell-v1");
        store.insert(entry("GET", "https://app.example/a.js", b"old"));
        store.insert(entry("GET", "https://app.example/a.js", b"new"));

        let key = RequestKey::new("GET", "https://app.example/a.js");
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&key).unwrap().body, b"new");
    }

    #[test]
    fn test_store_keys_distinguish_methods() {
        let mut store = Store::new("shell-v1");
        store.insert(entry("GET", "https://app.example/a", b"1"));
        store.insert(entry("HEAD", "https://app.example/a", b""));
        assert_eq!(store.keys().len(), 2);
    }

    #[test]
    fn test_store_remove_entry() {
        let mut store = Store::new("shell-v1");
        assert_eq!(store.name(), "shell-v1");

        let key = RequestKey::new("GET", "https://app.example/a.js");
        store.insert(entry("GET", "https://app.example/a.js", b"alpha"));
        assert!(store.remove(&key));
        assert!(store.is_empty());
        assert!(!store.remove(&key));
    }

    #[tokio::test]
    async fn test_registry_open_is_idempotent() {
        let registry = StoreRegistry::new();
        registry.open("assets").await;
        registry
            .insert_into("assets", entry("GET", "https://app.example/logo.png", b"png"))
            .await
            .unwrap();
        registry.open("assets").await;

        assert_eq!(registry.entry_count("assets").await, Some(1));
    }

    #[tokio::test]
    async fn test_registry_insert_requires_store() {
        let registry = StoreRegistry::new();
        let result = registry
            .insert_into("missing", entry("GET", "https://app.example/a", b""))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_lookup_across_stores() {
        let registry = StoreRegistry::new();
        registry.open("shell-v1").await;
        registry.open("assets").await;
        registry
            .insert_into("assets", entry("GET", "https://app.example/logo.png", b"png"))
            .await
            .unwrap();

        let key = RequestKey::new("GET", "https://app.example/logo.png");
        assert!(registry.lookup(&key).await.is_some());
        assert!(registry.lookup_in("shell-v1", &key).await.is_none());
        assert!(registry.lookup_in("assets", &key).await.is_some());
    }

    #[tokio::test]
    async fn test_registry_remove() {
        let registry = StoreRegistry::new();
        registry.open("shell-v1").await;

        assert!(registry.remove("shell-v1").await.unwrap());
        assert!(!registry.has("shell-v1").await);
        assert!(!registry.remove("shell-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_registry_shared_between_clones() {
        let registry = StoreRegistry::new();
        let other = registry.clone();
        other.open("assets").await;
        other
            .insert_into("assets", entry("GET", "https://app.example/logo.png", b"png"))
            .await
            .unwrap();

        let key = RequestKey::new("GET", "https://app.example/logo.png");
        assert!(registry.lookup(&key).await.is_some());
    }
}
