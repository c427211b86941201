use crate::store::api::{
    CacheStoreConfig, ClusteredStore, ClusteredStoreFactory, Element, StoreCreateError, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Process-local store. Backs tests and non-clustered deployments where peer
/// replication alone provides the coherence.
pub struct InMemoryClusteredStore {
    caches: RwLock<HashMap<String, HashMap<String, Element>>>,
    disposed: AtomicBool,
}

impl InMemoryClusteredStore {
    pub fn new() -> Self {
        InMemoryClusteredStore {
            caches: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StoreError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryClusteredStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusteredStore for InMemoryClusteredStore {
    async fn get(&self, cache_name: &str, key: &str) -> Result<Option<Element>, StoreError> {
        self.check_alive()?;
        let caches = self.caches.read().unwrap();
        Ok(caches.get(cache_name).and_then(|c| c.get(key)).cloned())
    }

    async fn put(&self, cache_name: &str, element: Element) -> Result<bool, StoreError> {
        self.check_alive()?;
        let mut caches = self.caches.write().unwrap();
        let cache = caches.entry(cache_name.to_string()).or_default();
        let previous = cache.insert(element.key.clone(), element);
        Ok(previous.is_some())
    }

    async fn remove(&self, cache_name: &str, key: &str) -> Result<Option<Element>, StoreError> {
        self.check_alive()?;
        let mut caches = self.caches.write().unwrap();
        Ok(caches.get_mut(cache_name).and_then(|c| c.remove(key)))
    }

    async fn remove_all(&self, cache_name: &str) -> Result<(), StoreError> {
        self.check_alive()?;
        let mut caches = self.caches.write().unwrap();
        if let Some(cache) = caches.get_mut(cache_name) {
            cache.clear();
        }
        Ok(())
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError> {
        self.check_alive()?;
        let caches = self.caches.read().unwrap();
        Ok(caches
            .get(cache_name)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        self.disposed.store(true, Ordering::Release);
        self.caches.write().unwrap().clear();
        Ok(())
    }
}

/// Factory producing a fresh in-memory store on every call. Never fails.
pub struct InMemoryStoreFactory;

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        InMemoryStoreFactory
    }
}

impl Default for InMemoryStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusteredStoreFactory for InMemoryStoreFactory {
    async fn create(
        &self,
        _cache_configs: HashMap<String, CacheStoreConfig>,
    ) -> Result<Arc<dyn ClusteredStore>, StoreCreateError> {
        Ok(Arc::new(InMemoryClusteredStore::new()))
    }
}
