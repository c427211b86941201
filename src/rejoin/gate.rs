use crate::rejoin::state::{ClusterStoreState, StoreHandle};
use crate::store::Element;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Behavior of cache operations while the cluster attachment is recovering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NonStopPolicy {
    /// Fail immediately with `ClusterUnavailableError`.
    Exception,
    /// Block up to the configured timeout for recovery, then fail.
    Timeout,
    /// Serve reads from the cache's local fallback; writes fail immediately.
    LocalReadsOnly,
}

impl Default for NonStopPolicy {
    fn default() -> Self {
        NonStopPolicy::Exception
    }
}

/// Distinct from "key not found": the cluster is unavailable and the cache's
/// NonStop policy chose to give up rather than wait longer.
#[derive(Debug, thiserror::Error)]
#[error("cluster unavailable (waited {waited:?})")]
pub struct ClusterUnavailableError {
    pub waited: Duration,
}

pub(crate) enum GateDecision {
    /// Operate on the clustered store.
    Store(StoreHandle),
    /// Serve this read from the local fallback cache.
    LocalRead,
}

/// Wraps every store operation of one cache. While Connected, the cost is one
/// watch borrow; otherwise the policy decides. Never deadlocks the caller:
/// the Timeout policy always returns within its bound, even if recovery never
/// completes.
pub(crate) struct NonStopOperationGate {
    policy: NonStopPolicy,
    nonstop_timeout: Duration,
    state_rx: watch::Receiver<ClusterStoreState>,
    has_fallback: bool,
}

impl NonStopOperationGate {
    pub fn new(
        policy: NonStopPolicy,
        nonstop_timeout: Duration,
        state_rx: watch::Receiver<ClusterStoreState>,
        has_fallback: bool,
    ) -> Self {
        NonStopOperationGate {
            policy,
            nonstop_timeout,
            state_rx,
            has_fallback,
        }
    }

    pub async fn gate_write(&self) -> Result<StoreHandle, ClusterUnavailableError> {
        if let Some(handle) = self.current_connected() {
            return Ok(handle);
        }
        match self.policy {
            NonStopPolicy::Timeout => self.await_connected().await,
            NonStopPolicy::Exception | NonStopPolicy::LocalReadsOnly => {
                Err(ClusterUnavailableError {
                    waited: Duration::from_millis(0),
                })
            }
        }
    }

    pub async fn gate_read(&self) -> Result<GateDecision, ClusterUnavailableError> {
        if let Some(handle) = self.current_connected() {
            return Ok(GateDecision::Store(handle));
        }
        match self.policy {
            NonStopPolicy::Exception => Err(ClusterUnavailableError {
                waited: Duration::from_millis(0),
            }),
            NonStopPolicy::Timeout => self.await_connected().await.map(GateDecision::Store),
            NonStopPolicy::LocalReadsOnly => {
                if self.has_fallback {
                    Ok(GateDecision::LocalRead)
                } else {
                    Err(ClusterUnavailableError {
                        waited: Duration::from_millis(0),
                    })
                }
            }
        }
    }

    fn current_connected(&self) -> Option<StoreHandle> {
        match &*self.state_rx.borrow() {
            ClusterStoreState::Connected(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    async fn await_connected(&self) -> Result<StoreHandle, ClusterUnavailableError> {
        let mut rx = self.state_rx.clone();
        let deadline = Instant::now() + self.nonstop_timeout;

        loop {
            let connected = match &*rx.borrow() {
                ClusterStoreState::Connected(handle) => Some(handle.clone()),
                _ => None,
            };
            if let Some(handle) = connected {
                return Ok(handle);
            }

            match time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Controller is gone (shutdown); no recovery will ever come.
                Ok(Err(_)) => {
                    return Err(ClusterUnavailableError {
                        waited: self.nonstop_timeout,
                    })
                }
                Err(_) => {
                    return Err(ClusterUnavailableError {
                        waited: self.nonstop_timeout,
                    })
                }
            }
        }
    }
}

/// Local-only mirror of one cache, kept write-through while connected so the
/// LocalReadsOnly policy has something to serve during an outage.
pub(crate) struct LocalFallbackCache {
    entries: RwLock<HashMap<String, Element>>,
}

impl LocalFallbackCache {
    pub fn new() -> Self {
        LocalFallbackCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Element> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn put(&self, element: Element) {
        self.entries
            .write()
            .unwrap()
            .insert(element.key.clone(), element);
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryClusteredStore;
    use std::sync::Arc;

    fn connected_handle() -> StoreHandle {
        StoreHandle {
            store: Arc::new(InMemoryClusteredStore::new()),
            generation: 1,
        }
    }

    #[tokio::test]
    async fn connected_state_passes_through() {
        let (_tx, rx) = watch::channel(ClusterStoreState::Connected(connected_handle()));
        let gate = NonStopOperationGate::new(NonStopPolicy::Exception, Duration::from_secs(1), rx, false);

        assert!(gate.gate_write().await.is_ok());
        assert!(matches!(gate.gate_read().await, Ok(GateDecision::Store(_))));
    }

    #[tokio::test]
    async fn exception_policy_fails_immediately_while_rejoining() {
        let (_tx, rx) = watch::channel(ClusterStoreState::Rejoining);
        let gate = NonStopOperationGate::new(NonStopPolicy::Exception, Duration::from_secs(5), rx, false);

        let started = Instant::now();
        let result = gate.gate_write().await;
        assert!(result.is_err());
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "exception policy must not block"
        );
    }

    #[tokio::test]
    async fn timeout_policy_blocks_at_most_the_configured_bound() {
        let (_tx, rx) = watch::channel(ClusterStoreState::Rejoining);
        let nonstop_timeout = Duration::from_millis(150);
        let gate = NonStopOperationGate::new(NonStopPolicy::Timeout, nonstop_timeout, rx, false);

        let started = Instant::now();
        let result = gate.gate_read().await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        assert!(elapsed >= nonstop_timeout);
        assert!(
            elapsed < nonstop_timeout + Duration::from_secs(1),
            "timeout policy must return close to its bound"
        );
    }

    #[tokio::test]
    async fn timeout_policy_unblocks_when_recovery_completes() {
        let (tx, rx) = watch::channel(ClusterStoreState::Rejoining);
        let gate =
            NonStopOperationGate::new(NonStopPolicy::Timeout, Duration::from_secs(10), rx, false);

        tokio::task::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(ClusterStoreState::Connected(connected_handle()));
        });

        let started = Instant::now();
        let result = gate.gate_write().await;
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn local_reads_only_serves_reads_and_rejects_writes() {
        let (_tx, rx) = watch::channel(ClusterStoreState::Rejoining);
        let gate = NonStopOperationGate::new(
            NonStopPolicy::LocalReadsOnly,
            Duration::from_secs(5),
            rx,
            true,
        );

        assert!(matches!(gate.gate_read().await, Ok(GateDecision::LocalRead)));
        assert!(gate.gate_write().await.is_err());
    }

    #[tokio::test]
    async fn local_reads_only_without_fallback_fails() {
        let (_tx, rx) = watch::channel(ClusterStoreState::Disconnected);
        let gate = NonStopOperationGate::new(
            NonStopPolicy::LocalReadsOnly,
            Duration::from_secs(5),
            rx,
            false,
        );

        assert!(gate.gate_read().await.is_err());
    }
}
