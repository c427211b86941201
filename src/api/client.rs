use crate::bootstrap::BootstrapLoader;
use crate::events::ClusterEventListener;
use crate::events::EventBusPublisher;
use crate::membership::{HeartbeatService, Peer, PeerId, PeerRegistry};
use crate::rejoin::{
    ClusterStoreState, ClusterUnavailableError, GateDecision, LocalFallbackCache,
    NonStopOperationGate, NonStopPolicy, RejoinState,
};
use crate::replication::{
    AsyncDispatcher, AsyncReplicationQueue, BatchSender, CachePeerClient, EventPropagator,
    PropagationError,
};
use crate::server::RpcServerShutdownHandle;
use crate::stop_signal;
use crate::store::{CacheStoreConfig, ClusteredStore, Element, StoreError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;

/// How one cache participates in the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplicationMode {
    /// Mutations ship to peers on the mutating call path.
    Synchronous,
    /// Mutations queue locally and ship in periodic batches.
    Asynchronous,
}

/// Per-cache replication settings. The flag defaults mirror the usual
/// deployment: replicate everything, batched delivery, warm start.
pub struct CacheReplicationConfig {
    pub cache_name: String,
    pub replication_mode: ReplicationMode,
    pub replicate_puts: bool,
    pub replicate_updates: bool,
    pub replicate_removals: bool,
    pub nonstop_policy: NonStopPolicy,
    /// Warm this cache from a peer when it is added.
    pub bootstrap: bool,
    /// Keep a local write-through mirror for the LocalReadsOnly policy.
    pub local_fallback: bool,
    pub max_entries: Option<usize>,
}

impl CacheReplicationConfig {
    pub fn new<S: Into<String>>(cache_name: S) -> Self {
        CacheReplicationConfig {
            cache_name: cache_name.into(),
            replication_mode: ReplicationMode::Asynchronous,
            replicate_puts: true,
            replicate_updates: true,
            replicate_removals: true,
            nonstop_policy: NonStopPolicy::default(),
            bootstrap: true,
            local_fallback: false,
            max_entries: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddCacheError {
    #[error("cache '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheOpError {
    #[error(transparent)]
    ClusterUnavailable(#[from] ClusterUnavailableError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The local mutation already succeeded; only delivery to a peer failed.
    #[error("replication failed after local mutation: {0}")]
    Replication(PropagationError),
}

/// Everything the client and the RPC server need to operate one cache.
pub(crate) struct CacheRuntime {
    pub(crate) name: String,
    pub(crate) gate: NonStopOperationGate,
    pub(crate) propagator: EventPropagator,
    pub(crate) fallback: Option<LocalFallbackCache>,
    _dispatcher_stopper: Option<stop_signal::Stopper>,
}

/// Shared cache-name -> runtime index. The RPC server resolves incoming
/// replication against it; `add_cache` populates it.
#[derive(Clone)]
pub(crate) struct CacheRuntimeMap {
    inner: Arc<RwLock<HashMap<String, Arc<CacheRuntime>>>>,
}

impl CacheRuntimeMap {
    pub fn new() -> Self {
        CacheRuntimeMap {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn lookup(&self, cache_name: &str) -> Option<Arc<CacheRuntime>> {
        self.inner.read().unwrap().get(cache_name).cloned()
    }

    /// False if the name was already taken.
    pub fn insert_if_absent(&self, runtime: Arc<CacheRuntime>) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(&runtime.name) {
            return false;
        }
        inner.insert(runtime.name.clone(), runtime);
        true
    }
}

/// One cache as seen by the application: local store semantics, with every
/// mutation replicated per the cache's `CacheReplicationConfig` and every
/// operation gated by its NonStop policy.
pub struct ReplicatedCache {
    pub(super) inner: Arc<CacheRuntime>,
}

impl ReplicatedCache {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns Ok(true) if an existing entry was replaced.
    pub async fn put(&self, element: Element) -> Result<bool, CacheOpError> {
        let handle = self.inner.gate.gate_write().await?;
        let replaced = handle.store.put(&self.inner.name, element.clone()).await?;

        if let Some(fallback) = &self.inner.fallback {
            fallback.put(element.clone());
        }

        let propagated = if replaced {
            self.inner.propagator.on_update(&element).await
        } else {
            self.inner.propagator.on_put(&element).await
        };
        propagated.map_err(CacheOpError::Replication)?;

        Ok(replaced)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Element>, CacheOpError> {
        match self.inner.gate.gate_read().await? {
            GateDecision::Store(handle) => Ok(handle.store.get(&self.inner.name, key).await?),
            GateDecision::LocalRead => Ok(self
                .inner
                .fallback
                .as_ref()
                .and_then(|fallback| fallback.get(key))),
        }
    }

    pub async fn remove(&self, key: &str) -> Result<Option<Element>, CacheOpError> {
        let handle = self.inner.gate.gate_write().await?;
        let removed = handle.store.remove(&self.inner.name, key).await?;

        if let Some(fallback) = &self.inner.fallback {
            fallback.remove(key);
        }

        // A no-op removal is not a mutation; peers hear nothing.
        if removed.is_some() {
            self.inner
                .propagator
                .on_remove(key)
                .await
                .map_err(CacheOpError::Replication)?;
        }

        Ok(removed)
    }

    pub async fn remove_all(&self) -> Result<(), CacheOpError> {
        let handle = self.inner.gate.gate_write().await?;
        handle.store.remove_all(&self.inner.name).await?;

        if let Some(fallback) = &self.inner.fallback {
            fallback.clear();
        }

        self.inner
            .propagator
            .on_remove_all()
            .await
            .map_err(CacheOpError::Replication)?;

        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>, CacheOpError> {
        match self.inner.gate.gate_read().await? {
            GateDecision::Store(handle) => Ok(handle.store.keys(&self.inner.name).await?),
            GateDecision::LocalRead => Ok(self
                .inner
                .fallback
                .as_ref()
                .map(|fallback| fallback.keys())
                .unwrap_or_default()),
        }
    }
}

/// Handle to this node's cluster attachment. Caches are added through it;
/// dropping it alone does not stop the background tasks, `shutdown` does.
pub struct ClusterClient {
    pub(super) logger: slog::Logger,
    pub(super) local_peer_id: PeerId,
    pub(super) local_rpc_addr: SocketAddr,
    pub(super) caches: CacheRuntimeMap,
    pub(super) cache_configs: Arc<RwLock<HashMap<String, CacheStoreConfig>>>,
    pub(super) registry: Arc<PeerRegistry>,
    pub(super) events: EventBusPublisher,
    pub(super) state_rx: watch::Receiver<ClusterStoreState>,
    pub(super) disconnect_tx: mpsc::Sender<()>,
    pub(super) peer_client: Arc<dyn CachePeerClient>,
    pub(super) batch_sender: Arc<BatchSender>,
    pub(super) async_batch_interval: Duration,
    pub(super) async_queue_capacity: usize,
    pub(super) nonstop_timeout: Duration,
    pub(super) bootstrap_chunk_target_bytes: usize,
    pub(super) dispose_grace: Duration,
    pub(super) heartbeat: Option<HeartbeatService>,
    pub(super) server_shutdown: RpcServerShutdownHandle,
}

impl ClusterClient {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Where this node's peer RPC surface is bound. Useful when the configured
    /// bind address used port 0.
    pub fn local_rpc_addr(&self) -> SocketAddr {
        self.local_rpc_addr
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.list()
    }

    pub fn rejoin_state(&self) -> RejoinState {
        self.state_rx.borrow().rejoin_state()
    }

    pub fn subscribe(&self) -> ClusterEventListener {
        self.events.subscribe()
    }

    /// Tells the rejoin controller the cluster attachment is gone. Idempotent:
    /// signals landing during an in-flight recovery coalesce into it.
    pub fn notify_cluster_offline(&self) {
        if self.disconnect_tx.try_send(()).is_err() {
            // Full queue or controller gone; either way recovery is already
            // underway or moot.
            slog::info!(self.logger, "Cluster-offline signal not enqueued");
        }
    }

    pub async fn add_cache(
        &self,
        config: CacheReplicationConfig,
    ) -> Result<ReplicatedCache, AddCacheError> {
        if self.caches.lookup(&config.cache_name).is_some() {
            return Err(AddCacheError::AlreadyRegistered(config.cache_name));
        }

        let cache_logger = self
            .logger
            .new(slog::o!("cache" => config.cache_name.clone()));

        // Registered before the runtime exists so the next rejoin's store
        // creation already includes this cache.
        self.cache_configs.write().unwrap().insert(
            config.cache_name.clone(),
            CacheStoreConfig {
                cache_name: config.cache_name.clone(),
                max_entries: config.max_entries,
            },
        );

        let (queue, dispatcher_stopper) = match config.replication_mode {
            ReplicationMode::Synchronous => (None, None),
            ReplicationMode::Asynchronous => {
                let queue = Arc::new(AsyncReplicationQueue::new(self.async_queue_capacity));
                let stopper = AsyncDispatcher::spawn(
                    cache_logger.clone(),
                    queue.clone(),
                    self.batch_sender.clone(),
                    self.async_batch_interval,
                );
                (Some(queue), Some(stopper))
            }
        };

        let propagator = EventPropagator::new(
            cache_logger.clone(),
            config.cache_name.clone(),
            config.replicate_puts,
            config.replicate_updates,
            config.replicate_removals,
            self.batch_sender.clone(),
            queue,
        );

        let fallback = if config.local_fallback {
            Some(LocalFallbackCache::new())
        } else {
            None
        };
        let gate = NonStopOperationGate::new(
            config.nonstop_policy,
            self.nonstop_timeout,
            self.state_rx.clone(),
            fallback.is_some(),
        );

        let runtime = Arc::new(CacheRuntime {
            name: config.cache_name.clone(),
            gate,
            propagator,
            fallback,
            _dispatcher_stopper: dispatcher_stopper,
        });
        if !self.caches.insert_if_absent(runtime.clone()) {
            return Err(AddCacheError::AlreadyRegistered(config.cache_name));
        }

        if config.bootstrap && !self.registry.is_empty() {
            self.bootstrap_cache(&cache_logger, &config.cache_name).await;
        }

        Ok(ReplicatedCache { inner: runtime })
    }

    /// Best effort: a cache that cannot be warmed starts cold.
    async fn bootstrap_cache(&self, cache_logger: &slog::Logger, cache_name: &str) {
        let store: Option<Arc<dyn ClusteredStore>> = match &*self.state_rx.borrow() {
            ClusterStoreState::Connected(handle) => Some(handle.store.clone()),
            _ => None,
        };
        let store = match store {
            Some(store) => store,
            None => {
                slog::warn!(
                    cache_logger,
                    "Skipping bootstrap of '{}'; store unavailable",
                    cache_name
                );
                return;
            }
        };

        let loader = BootstrapLoader::new(
            cache_logger.clone(),
            self.registry.clone(),
            self.peer_client.clone(),
            self.bootstrap_chunk_target_bytes,
        );
        if let Err(e) = loader.load(cache_name, &store).await {
            slog::warn!(
                cache_logger,
                "Cache '{}' starts cold; bootstrap failed: {}",
                cache_name,
                e
            );
        }
    }

    /// Stops the heartbeat loops, the RPC server, and the rejoin controller,
    /// then disposes the current store, bounded by the dispose grace period.
    pub async fn shutdown(self) {
        slog::info!(self.logger, "Shutting down cluster client");

        let current = match &*self.state_rx.borrow() {
            ClusterStoreState::Connected(handle) => Some(handle.clone()),
            _ => None,
        };

        let ClusterClient {
            logger,
            heartbeat,
            server_shutdown,
            disconnect_tx,
            dispose_grace,
            ..
        } = self;
        drop(heartbeat);
        drop(server_shutdown);
        // Closing the signal channel stops the rejoin controller, even if it
        // is mid-retry.
        drop(disconnect_tx);

        if let Some(handle) = current {
            match time::timeout(dispose_grace, handle.store.dispose()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    slog::warn!(logger, "Store disposal failed during shutdown: {}", e);
                }
                Err(_) => {
                    slog::warn!(
                        logger,
                        "Store disposal did not finish within {:?}; abandoning it",
                        dispose_grace
                    );
                }
            }
        }
    }
}
