use crate::replication::channel::{AsyncReplicationQueue, BatchSender, PropagationError};
use crate::replication::message::{CacheOperation, ReplicationMessage};
use crate::store::Element;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-cache mutation hooks. Invoked on the mutating call path; turns local
/// mutations into ReplicationMessages and hands them to the configured
/// channel. The async queue, when present, selects batched delivery.
pub(crate) struct EventPropagator {
    logger: slog::Logger,
    cache_name: String,
    replicate_puts: bool,
    replicate_updates: bool,
    replicate_removals: bool,
    sender: Arc<BatchSender>,
    /// Some = async (batched) mode, None = synchronous mode.
    queue: Option<Arc<AsyncReplicationQueue>>,
    sequence: AtomicU64,
    transient_warned: AtomicBool,
}

impl EventPropagator {
    pub fn new(
        logger: slog::Logger,
        cache_name: String,
        replicate_puts: bool,
        replicate_updates: bool,
        replicate_removals: bool,
        sender: Arc<BatchSender>,
        queue: Option<Arc<AsyncReplicationQueue>>,
    ) -> Self {
        EventPropagator {
            logger,
            cache_name,
            replicate_puts,
            replicate_updates,
            replicate_removals,
            sender,
            queue,
            sequence: AtomicU64::new(0),
            transient_warned: AtomicBool::new(false),
        }
    }

    pub async fn on_put(&self, element: &Element) -> Result<(), PropagationError> {
        if !self.replicate_puts {
            return Ok(());
        }
        match self.wire_payload(element) {
            Some(payload) => {
                let message = self.next_message(CacheOperation::Put, element.key.clone(), Some(payload));
                self.dispatch(message).await
            }
            None => Ok(()),
        }
    }

    pub async fn on_update(&self, element: &Element) -> Result<(), PropagationError> {
        if !self.replicate_updates {
            return Ok(());
        }
        match self.wire_payload(element) {
            Some(payload) => {
                let message =
                    self.next_message(CacheOperation::Update, element.key.clone(), Some(payload));
                self.dispatch(message).await
            }
            None => Ok(()),
        }
    }

    pub async fn on_remove(&self, key: &str) -> Result<(), PropagationError> {
        if !self.replicate_removals {
            return Ok(());
        }
        let message = self.next_message(CacheOperation::Remove, key.to_string(), None);
        self.dispatch(message).await
    }

    /// Always sent eagerly, even in async mode: a RemoveAll sitting behind
    /// queued puts would let stale entries resurrect on the peers. Queued
    /// messages are flushed ahead of it so it cannot overtake them either.
    pub async fn on_remove_all(&self) -> Result<(), PropagationError> {
        if !self.replicate_removals {
            return Ok(());
        }
        let message = self.next_message(CacheOperation::RemoveAll, String::new(), None);

        match &self.queue {
            None => self.sender.send_to_all(&[message]).await,
            Some(queue) => {
                // Wait out any in-flight dispatcher flush; the clear must hit
                // the peers after every batch drained before it.
                let _send_guard = queue.lock_sends().await;
                let (mut batch, shed) = queue.drain();
                if shed > 0 {
                    slog::warn!(
                        self.logger,
                        "Replication queue overflowed; shed {} oldest message(s) before remove_all flush",
                        shed
                    );
                }
                batch.push(message);
                self.sender.send_to_all(&batch).await
            }
        }
    }

    /// Next sequence number; the monotonic counter is what gives a (cache,
    /// peer) pair its FIFO guarantee.
    fn next_message(
        &self,
        operation: CacheOperation,
        key: String,
        payload: Option<Bytes>,
    ) -> ReplicationMessage {
        ReplicationMessage {
            cache_name: self.cache_name.clone(),
            operation,
            key,
            payload,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// None = payload cannot cross the wire; the message must never be
    /// created. Warns once per cache, never fails the mutating caller.
    fn wire_payload(&self, element: &Element) -> Option<Bytes> {
        match element.payload_bytes() {
            Some(bytes) => Some(bytes.clone()),
            None => {
                if !self.transient_warned.swap(true, Ordering::AcqRel) {
                    slog::warn!(
                        self.logger,
                        "Cache '{}' stores transient (non-serializable) values; those entries will \
                         not be replicated. Further occurrences will not be logged.",
                        self.cache_name
                    );
                }
                None
            }
        }
    }

    async fn dispatch(&self, message: ReplicationMessage) -> Result<(), PropagationError> {
        match &self.queue {
            Some(queue) => {
                queue.offer(message);
                Ok(())
            }
            None => self.sender.send_to_all(&[message]).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{PeerId, PeerRegistry};
    use crate::replication::peer_client::{CachePeerClient, PeerRpcError};
    use slog::Drain;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard.fuse(), slog::o!())
    }

    struct RecordingPeerClient {
        batches: Mutex<Vec<Vec<ReplicationMessage>>>,
    }

    #[async_trait::async_trait]
    impl CachePeerClient for RecordingPeerClient {
        async fn receive_batch(
            &self,
            _peer_addr: SocketAddr,
            messages: &[ReplicationMessage],
        ) -> Result<(), PeerRpcError> {
            self.batches.lock().unwrap().push(messages.to_vec());
            Ok(())
        }

        async fn list_keys(
            &self,
            _peer_addr: SocketAddr,
            _cache_name: &str,
        ) -> Result<Vec<String>, PeerRpcError> {
            Ok(Vec::new())
        }

        async fn get_elements(
            &self,
            _peer_addr: SocketAddr,
            _cache_name: &str,
            _keys: &[String],
        ) -> Result<Vec<Element>, PeerRpcError> {
            Ok(Vec::new())
        }
    }

    fn harness(
        queue: Option<Arc<AsyncReplicationQueue>>,
    ) -> (EventPropagator, Arc<RecordingPeerClient>) {
        let client = Arc::new(RecordingPeerClient {
            batches: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert(
            PeerId::new("peer-1"),
            "127.0.0.1:9001".parse().unwrap(),
            Instant::now(),
        );
        let sender = Arc::new(BatchSender::new(test_logger(), registry, client.clone()));

        let propagator = EventPropagator::new(
            test_logger(),
            "users".to_string(),
            true,
            true,
            true,
            sender,
            queue,
        );
        (propagator, client)
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing_across_operations() {
        let queue = Arc::new(AsyncReplicationQueue::new(100));
        let (propagator, _) = harness(Some(queue.clone()));

        let element = Element::serialized("k1", Bytes::from_static(b"v"));
        propagator.on_put(&element).await.unwrap();
        propagator.on_update(&element).await.unwrap();
        propagator.on_remove("k1").await.unwrap();

        let (batch, _) = queue.drain();
        let sequences: Vec<u64> = batch.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(batch[0].operation, CacheOperation::Put);
        assert_eq!(batch[1].operation, CacheOperation::Update);
        assert_eq!(batch[2].operation, CacheOperation::Remove);
    }

    #[tokio::test]
    async fn transient_payload_is_dropped_silently() {
        let queue = Arc::new(AsyncReplicationQueue::new(100));
        let (propagator, _) = harness(Some(queue.clone()));

        let transient = Element::transient("k1", Arc::new(5_usize));
        propagator.on_put(&transient).await.unwrap();

        let (batch, _) = queue.drain();
        assert!(batch.is_empty(), "transient payload must never reach the queue");
    }

    #[tokio::test]
    async fn remove_all_flushes_queued_messages_ahead_of_itself() {
        let queue = Arc::new(AsyncReplicationQueue::new(100));
        let (propagator, client) = harness(Some(queue.clone()));

        let element = Element::serialized("k1", Bytes::from_static(b"v"));
        propagator.on_put(&element).await.unwrap();
        propagator.on_remove_all().await.unwrap();

        let batches = client.batches.lock().unwrap();
        assert_eq!(batches.len(), 1, "remove_all must send eagerly");
        let ops: Vec<CacheOperation> = batches[0].iter().map(|m| m.operation).collect();
        assert_eq!(ops, vec![CacheOperation::Put, CacheOperation::RemoveAll]);
        drop(batches);
        assert_eq!(queue.len(), 0);
    }

    /// Applies Put batches slowly, recording the order operations complete.
    struct SlowPutPeerClient {
        applied: Mutex<Vec<CacheOperation>>,
    }

    #[async_trait::async_trait]
    impl CachePeerClient for SlowPutPeerClient {
        async fn receive_batch(
            &self,
            _peer_addr: SocketAddr,
            messages: &[ReplicationMessage],
        ) -> Result<(), PeerRpcError> {
            if messages.iter().any(|m| m.operation == CacheOperation::Put) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            self.applied
                .lock()
                .unwrap()
                .extend(messages.iter().map(|m| m.operation));
            Ok(())
        }

        async fn list_keys(
            &self,
            _peer_addr: SocketAddr,
            _cache_name: &str,
        ) -> Result<Vec<String>, PeerRpcError> {
            Ok(Vec::new())
        }

        async fn get_elements(
            &self,
            _peer_addr: SocketAddr,
            _cache_name: &str,
            _keys: &[String],
        ) -> Result<Vec<Element>, PeerRpcError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn remove_all_waits_for_in_flight_async_flush() {
        let client = Arc::new(SlowPutPeerClient {
            applied: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert(
            PeerId::new("peer-1"),
            "127.0.0.1:9001".parse().unwrap(),
            Instant::now(),
        );
        let sender = Arc::new(BatchSender::new(test_logger(), registry, client.clone()));
        let queue = Arc::new(AsyncReplicationQueue::new(100));
        let propagator = EventPropagator::new(
            test_logger(),
            "users".to_string(),
            true,
            true,
            true,
            sender.clone(),
            Some(queue.clone()),
        );
        let _stopper = crate::replication::AsyncDispatcher::spawn(
            test_logger(),
            queue.clone(),
            sender,
            std::time::Duration::from_millis(20),
        );

        let element = Element::serialized("k1", Bytes::from_static(b"v"));
        propagator.on_put(&element).await.unwrap();
        // Let the dispatcher pick the put up and stall mid-send.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        propagator.on_remove_all().await.unwrap();

        let applied = client.applied.lock().unwrap();
        assert_eq!(
            *applied,
            vec![CacheOperation::Put, CacheOperation::RemoveAll],
            "the clear must reach the peer after the earlier queued put"
        );
    }

    #[tokio::test]
    async fn sync_mode_sends_immediately() {
        let (propagator, client) = harness(None);

        let element = Element::serialized("k1", Bytes::from_static(b"v"));
        propagator.on_put(&element).await.unwrap();

        assert_eq!(client.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_flags_suppress_replication() {
        let client = Arc::new(RecordingPeerClient {
            batches: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert(
            PeerId::new("peer-1"),
            "127.0.0.1:9001".parse().unwrap(),
            Instant::now(),
        );
        let sender = Arc::new(BatchSender::new(test_logger(), registry, client.clone()));
        let propagator = EventPropagator::new(
            test_logger(),
            "users".to_string(),
            false,
            false,
            false,
            sender,
            None,
        );

        let element = Element::serialized("k1", Bytes::from_static(b"v"));
        propagator.on_put(&element).await.unwrap();
        propagator.on_update(&element).await.unwrap();
        propagator.on_remove("k1").await.unwrap();
        propagator.on_remove_all().await.unwrap();

        assert!(client.batches.lock().unwrap().is_empty());
    }
}
