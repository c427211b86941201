use crate::membership::{PeerId, PeerRegistry};
use crate::replication::{CachePeerClient, PeerRpcError};
use crate::store::{ClusteredStore, StoreError};
use std::sync::Arc;

/// Keys fetched up front to estimate the average element size before
/// committing to a chunk size.
const PROBE_KEY_COUNT: usize = 10;

/// Fallback size estimate when the probe returns nothing.
const DEFAULT_ELEMENT_SIZE_ESTIMATE: usize = 1024;

#[derive(Debug)]
pub struct BootstrapReport {
    pub source_peer: PeerId,
    pub keys_total: usize,
    pub elements_loaded: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("no peer responded to the key listing")]
    NoResponsivePeer,
    #[error("bootstrap aborted after loading {loaded} element(s): {source}")]
    Aborted {
        loaded: usize,
        #[source]
        source: PeerRpcError,
    },
    #[error("store rejected a bootstrapped element: {0}")]
    Store(#[from] StoreError),
}

/// Warms a newly joined cache from the first responsive peer. Elements are
/// inserted straight into the store, never through the propagator, so the
/// transfer cannot echo back out as replication events.
pub(crate) struct BootstrapLoader {
    logger: slog::Logger,
    registry: Arc<PeerRegistry>,
    peer_client: Arc<dyn CachePeerClient>,
    chunk_target_bytes: usize,
}

impl BootstrapLoader {
    pub fn new(
        logger: slog::Logger,
        registry: Arc<PeerRegistry>,
        peer_client: Arc<dyn CachePeerClient>,
        chunk_target_bytes: usize,
    ) -> Self {
        BootstrapLoader {
            logger,
            registry,
            peer_client,
            chunk_target_bytes,
        }
    }

    /// Failure here is never fatal to cache creation; the caller logs the
    /// error and starts cold.
    pub async fn load(
        &self,
        cache_name: &str,
        store: &Arc<dyn ClusteredStore>,
    ) -> Result<BootstrapReport, BootstrapError> {
        let (source_peer, keys) = self.first_responsive_peer(cache_name).await?;

        if keys.is_empty() {
            return Ok(BootstrapReport {
                source_peer: source_peer.id,
                keys_total: 0,
                elements_loaded: 0,
            });
        }
        let keys_total = keys.len();

        let (mut loaded, average_size) = self
            .load_probe_chunk(cache_name, &source_peer, &keys, store)
            .await?;

        let chunk_size = std::cmp::max(1, self.chunk_target_bytes / average_size);
        let remaining = &keys[std::cmp::min(PROBE_KEY_COUNT, keys.len())..];
        for key_chunk in remaining.chunks(chunk_size) {
            let elements = self
                .peer_client
                .get_elements(source_peer.address, cache_name, key_chunk)
                .await
                .map_err(|e| BootstrapError::Aborted { loaded, source: e })?;

            for element in elements {
                store.put(cache_name, element).await?;
                loaded += 1;
            }
        }

        slog::info!(
            self.logger,
            "Bootstrapped cache '{}' with {} element(s) from peer {}",
            cache_name,
            loaded,
            source_peer.id
        );

        Ok(BootstrapReport {
            source_peer: source_peer.id,
            keys_total,
            elements_loaded: loaded,
        })
    }

    async fn first_responsive_peer(
        &self,
        cache_name: &str,
    ) -> Result<(crate::membership::Peer, Vec<String>), BootstrapError> {
        for peer in self.registry.list() {
            match self.peer_client.list_keys(peer.address, cache_name).await {
                Ok(keys) => return Ok((peer, keys)),
                Err(e) => {
                    slog::info!(
                        self.logger,
                        "Peer {} did not respond to key listing for '{}': {}",
                        peer.id,
                        cache_name,
                        e
                    );
                }
            }
        }
        Err(BootstrapError::NoResponsivePeer)
    }

    /// Loads the probe chunk and returns (elements loaded, average element
    /// size estimate in bytes, at least 1).
    async fn load_probe_chunk(
        &self,
        cache_name: &str,
        source_peer: &crate::membership::Peer,
        keys: &[String],
        store: &Arc<dyn ClusteredStore>,
    ) -> Result<(usize, usize), BootstrapError> {
        let probe_keys = &keys[..std::cmp::min(PROBE_KEY_COUNT, keys.len())];
        let elements = self
            .peer_client
            .get_elements(source_peer.address, cache_name, probe_keys)
            .await
            .map_err(|e| BootstrapError::Aborted { loaded: 0, source: e })?;

        let average_size = if elements.is_empty() {
            DEFAULT_ELEMENT_SIZE_ESTIMATE
        } else {
            let total: usize = elements
                .iter()
                .map(|e| e.payload_bytes().map(|b| b.len()).unwrap_or(0))
                .sum();
            std::cmp::max(1, total / elements.len())
        };

        let mut loaded = 0;
        for element in elements {
            store.put(cache_name, element).await?;
            loaded += 1;
        }
        Ok((loaded, average_size))
    }
}
