use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A single cache entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    pub key: String,
    pub payload: ElementPayload,
}

impl Element {
    pub fn serialized(key: impl Into<String>, payload: Bytes) -> Self {
        Element {
            key: key.into(),
            payload: ElementPayload::Serialized(payload),
        }
    }

    /// A process-local value that cannot cross the wire. It is stored and
    /// retrievable locally but will never be replicated or bootstrapped.
    pub fn transient(key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) -> Self {
        Element {
            key: key.into(),
            payload: ElementPayload::Transient(value),
        }
    }

    pub fn payload_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            ElementPayload::Serialized(bytes) => Some(bytes),
            ElementPayload::Transient(_) => None,
        }
    }
}

#[derive(Clone)]
pub enum ElementPayload {
    Serialized(Bytes),
    Transient(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for ElementPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementPayload::Serialized(bytes) => write!(f, "Serialized({} bytes)", bytes.len()),
            ElementPayload::Transient(_) => write!(f, "Transient"),
        }
    }
}

impl PartialEq for ElementPayload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ElementPayload::Serialized(a), ElementPayload::Serialized(b)) => a == b,
            (ElementPayload::Transient(a), ElementPayload::Transient(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Per-cache configuration handed to the store factory at (re)creation time.
#[derive(Clone, Debug)]
pub struct CacheStoreConfig {
    pub cache_name: String,
    pub max_entries: Option<usize>,
}

impl CacheStoreConfig {
    pub fn new(cache_name: impl Into<String>) -> Self {
        CacheStoreConfig {
            cache_name: cache_name.into(),
            max_entries: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store has been disposed")]
    Disposed,
    #[error("store backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreCreateError {
    #[error("clustered runtime not available: {0}")]
    RuntimeUnavailable(String),
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// The active store behind every replicated cache. One store serves all
/// caches of a cache manager; operations are namespaced by cache name.
///
/// Implementations must tolerate calls after `dispose()` by returning
/// `StoreError::Disposed` rather than panicking; callers may hold a handle
/// across a rejoin swap.
#[async_trait::async_trait]
pub trait ClusteredStore: Send + Sync {
    async fn get(&self, cache_name: &str, key: &str) -> Result<Option<Element>, StoreError>;

    /// Returns true if the key was already present (an update).
    async fn put(&self, cache_name: &str, element: Element) -> Result<bool, StoreError>;

    async fn remove(&self, cache_name: &str, key: &str) -> Result<Option<Element>, StoreError>;

    async fn remove_all(&self, cache_name: &str) -> Result<(), StoreError>;

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError>;

    /// Releases backend resources. Called exactly once per store instance.
    async fn dispose(&self) -> Result<(), StoreError>;
}

/// Capability to (re)create the clustered store. Must be safely callable
/// repeatedly after prior failures; the rejoin controller will call it until
/// it succeeds.
#[async_trait::async_trait]
pub trait ClusteredStoreFactory: Send + Sync {
    async fn create(
        &self,
        cache_configs: HashMap<String, CacheStoreConfig>,
    ) -> Result<Arc<dyn ClusteredStore>, StoreCreateError>;
}
