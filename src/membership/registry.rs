use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Opaque identifier of a cache-manager process participating in the cluster.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A known remote peer and when we last heard from it.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    pub address: SocketAddr,
    pub last_heartbeat_at: Instant,
}

/// Tracks known remote peers and their liveness. Pure in-memory state; every
/// read hands out a copied snapshot so callers never hold the lock.
///
/// Invariants: a peer's id never changes while present, and no two entries
/// share an id. Iteration order is insertion order, which keeps membership
/// assertions deterministic.
pub(crate) struct PeerRegistry {
    peers: Mutex<Vec<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Records or refreshes a peer. Returns true if the peer was not
    /// previously known.
    pub fn upsert(&self, id: PeerId, address: SocketAddr, now: Instant) -> bool {
        let mut peers = self.peers.lock().unwrap();

        for peer in peers.iter_mut() {
            if peer.id == id {
                peer.address = address;
                peer.last_heartbeat_at = now;
                return false;
            }
        }

        peers.push(Peer {
            id,
            address,
            last_heartbeat_at: now,
        });
        true
    }

    /// Removes and returns every peer not heard from within the timeout.
    pub fn evict_stale(&self, now: Instant, staleness_timeout: Duration) -> Vec<Peer> {
        let mut peers = self.peers.lock().unwrap();

        let mut evicted = Vec::new();
        peers.retain(|peer| {
            let stale = now.saturating_duration_since(peer.last_heartbeat_at) > staleness_timeout;
            if stale {
                evicted.push(peer.clone());
            }
            !stale
        });

        evicted
    }

    /// Snapshot of current peers, in insertion order.
    pub fn list(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn upsert_reports_new_only_once() {
        let registry = PeerRegistry::new();
        let now = Instant::now();

        assert!(registry.upsert(PeerId::new("n1"), addr(4001), now));
        assert!(!registry.upsert(PeerId::new("n1"), addr(4001), now));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn upsert_refreshes_address_without_duplicating() {
        let registry = PeerRegistry::new();
        let now = Instant::now();

        registry.upsert(PeerId::new("n1"), addr(4001), now);
        registry.upsert(PeerId::new("n1"), addr(4002), now);

        let peers = registry.list();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, addr(4002));
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let registry = PeerRegistry::new();
        let now = Instant::now();

        registry.upsert(PeerId::new("n3"), addr(4003), now);
        registry.upsert(PeerId::new("n1"), addr(4001), now);
        registry.upsert(PeerId::new("n2"), addr(4002), now);

        let ids: Vec<String> = registry
            .list()
            .iter()
            .map(|p| p.id.as_str().to_string())
            .collect();
        // n3's refresh must not move it to the back.
        registry.upsert(PeerId::new("n3"), addr(4003), now);
        let ids_after: Vec<String> = registry
            .list()
            .iter()
            .map(|p| p.id.as_str().to_string())
            .collect();

        assert_eq!(ids, vec!["n3", "n1", "n2"]);
        assert_eq!(ids_after, vec!["n3", "n1", "n2"]);
    }

    #[tokio::test]
    async fn evicts_only_stale_peers() {
        let registry = PeerRegistry::new();
        let timeout = Duration::from_secs(5);
        let start = Instant::now();

        registry.upsert(PeerId::new("fresh"), addr(4001), start + Duration::from_secs(4));
        registry.upsert(PeerId::new("stale"), addr(4002), start);

        let evicted = registry.evict_stale(start + Duration::from_secs(6), timeout);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id.as_str(), "stale");
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].id.as_str(), "fresh");
    }

    #[tokio::test]
    async fn evict_on_empty_registry_is_a_noop() {
        let registry = PeerRegistry::new();
        let evicted = registry.evict_stale(Instant::now(), Duration::from_secs(1));
        assert!(evicted.is_empty());
    }
}
