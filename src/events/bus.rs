use crate::membership::{Peer, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-subscriber queue depth. A subscriber that falls this far behind starts
/// losing events rather than blocking the producers.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Identity of one attachment of this cache manager to the cluster. A rejoin
/// produces a new node with a bumped generation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterNode {
    pub peer_id: PeerId,
    pub generation: u64,
}

/// Cluster topology event, as observed by the local node.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    PeerJoined(Peer),
    PeerLeft(Peer),
    ClusterOffline,
    ClusterOnline,
    ClusterRejoined {
        old_node: ClusterNode,
        new_node: ClusterNode,
    },
}

type SubscriberMap = Mutex<HashMap<u64, mpsc::Sender<ClusterEvent>>>;

/// Observer registry with thread-safe subscribe/unsubscribe and a broadcast
/// that tolerates one subscriber's failure without affecting the others.
#[derive(Clone)]
pub(crate) struct EventBusPublisher {
    logger: slog::Logger,
    subscribers: Arc<SubscriberMap>,
    next_id: Arc<AtomicU64>,
}

impl EventBusPublisher {
    pub fn new(logger: slog::Logger) -> Self {
        EventBusPublisher {
            logger,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> ClusterEventListener {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);

        ClusterEventListener {
            id,
            receiver: rx,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn broadcast(&self, event: ClusterEvent) {
        let mut dead = Vec::new();

        {
            let subscribers = self.subscribers.lock().unwrap();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slog::warn!(
                            self.logger,
                            "Dropping event for slow subscriber {}: {:?}",
                            id,
                            event
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

/// Receiving end of one event-bus subscription. Unsubscribes on drop.
pub struct ClusterEventListener {
    id: u64,
    receiver: mpsc::Receiver<ClusterEvent>,
    subscribers: std::sync::Weak<SubscriberMap>,
}

impl ClusterEventListener {
    /// Returns the next event, or None once the cluster client has shut down.
    pub async fn next_event(&mut self) -> Option<ClusterEvent> {
        self.receiver.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ClusterEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ClusterEventListener {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().unwrap().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard.fuse(), slog::o!())
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let bus = EventBusPublisher::new(test_logger());
        let mut sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();

        bus.broadcast(ClusterEvent::ClusterOffline);

        assert!(matches!(
            sub_a.next_event().await,
            Some(ClusterEvent::ClusterOffline)
        ));
        assert!(matches!(
            sub_b.next_event().await,
            Some(ClusterEvent::ClusterOffline)
        ));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let bus = EventBusPublisher::new(test_logger());
        let sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();
        drop(sub_a);

        bus.broadcast(ClusterEvent::ClusterOnline);

        assert!(matches!(
            sub_b.next_event().await,
            Some(ClusterEvent::ClusterOnline)
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_events_without_stalling_broadcast() {
        let bus = EventBusPublisher::new(test_logger());
        let mut slow = bus.subscribe();

        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
            bus.broadcast(ClusterEvent::ClusterOffline);
        }

        // The queue holds at most SUBSCRIBER_QUEUE_DEPTH events; the overflow
        // was shed rather than deadlocking the publisher.
        let mut received = 0;
        while slow.try_next_event().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_DEPTH);
    }
}
