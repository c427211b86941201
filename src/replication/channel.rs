use crate::membership::{PeerId, PeerRegistry};
use crate::replication::message::ReplicationMessage;
use crate::replication::peer_client::{CachePeerClient, PeerRpcError};
use crate::stop_signal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

/// Reported to the mutating caller when a synchronous send could not reach a
/// peer. Callers may ignore it; the local mutation has already succeeded.
#[derive(Debug, thiserror::Error)]
#[error("replication to peer {peer} failed: {source}")]
pub struct PropagationError {
    pub peer: PeerId,
    #[source]
    pub source: PeerRpcError,
}

/// Fans a batch out to every peer currently in the registry. Delivery is
/// at-most-once-per-attempt: a failed peer is skipped, never retried.
pub(crate) struct BatchSender {
    logger: slog::Logger,
    registry: Arc<PeerRegistry>,
    peer_client: Arc<dyn CachePeerClient>,
}

impl BatchSender {
    pub fn new(
        logger: slog::Logger,
        registry: Arc<PeerRegistry>,
        peer_client: Arc<dyn CachePeerClient>,
    ) -> Self {
        BatchSender {
            logger,
            registry,
            peer_client,
        }
    }

    /// Sends to all peers, attempting every peer even after a failure.
    /// Returns the first failure, if any.
    pub async fn send_to_all(
        &self,
        messages: &[ReplicationMessage],
    ) -> Result<(), PropagationError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut first_failure = None;
        for peer in self.registry.list() {
            match self.peer_client.receive_batch(peer.address, messages).await {
                Ok(()) => {}
                Err(e) => {
                    slog::info!(
                        self.logger,
                        "Dropping batch of {} message(s) for unreachable peer {}: {}",
                        messages.len(),
                        peer.id,
                        e
                    );
                    if first_failure.is_none() {
                        first_failure = Some(PropagationError {
                            peer: peer.id,
                            source: e,
                        });
                    }
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }
}

struct QueueInner {
    messages: VecDeque<ReplicationMessage>,
    shed_since_flush: u64,
}

/// Bounded per-cache queue feeding the async dispatcher. `offer` never blocks
/// the mutating thread; overflow sheds oldest-first.
pub(crate) struct AsyncReplicationQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    send_lock: tokio::sync::Mutex<()>,
}

impl AsyncReplicationQueue {
    pub fn new(capacity: usize) -> Self {
        AsyncReplicationQueue {
            inner: Mutex::new(QueueInner {
                messages: VecDeque::new(),
                shed_since_flush: 0,
            }),
            capacity,
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Serializes flushes of this cache's queue. Every drain-and-send (the
    /// dispatcher's periodic flush and the eager remove_all flush) must hold
    /// this guard across the send, or a later batch could overtake an
    /// in-flight earlier one on the wire.
    pub async fn lock_sends(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    pub fn offer(&self, message: ReplicationMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.messages.len() >= self.capacity {
            inner.messages.pop_front();
            inner.shed_since_flush += 1;
        }
        inner.messages.push_back(message);
    }

    /// Takes everything queued so far plus the count of messages shed since
    /// the previous drain.
    pub fn drain(&self) -> (Vec<ReplicationMessage>, u64) {
        let mut inner = self.inner.lock().unwrap();
        let shed = inner.shed_since_flush;
        inner.shed_since_flush = 0;
        (inner.messages.drain(..).collect(), shed)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }
}

/// Drains one cache's async queue once per batch interval and ships the
/// accumulated batch to every peer. One dispatcher task per async cache.
pub(crate) struct AsyncDispatcher;

impl AsyncDispatcher {
    pub fn spawn(
        logger: slog::Logger,
        queue: Arc<AsyncReplicationQueue>,
        sender: Arc<BatchSender>,
        batch_interval: Duration,
    ) -> stop_signal::Stopper {
        let (stopper, stop_check) = stop_signal::new();
        tokio::task::spawn(Self::dispatch_task(
            logger,
            queue,
            sender,
            batch_interval,
            stop_check,
        ));
        stopper
    }

    async fn dispatch_task(
        logger: slog::Logger,
        queue: Arc<AsyncReplicationQueue>,
        sender: Arc<BatchSender>,
        batch_interval: Duration,
        stop_check: stop_signal::StopCheck,
    ) {
        let mut interval = time::interval(batch_interval);
        loop {
            interval.tick().await;
            if stop_check.should_stop() {
                return;
            }

            let _send_guard = queue.lock_sends().await;
            let (batch, shed) = queue.drain();
            if shed > 0 {
                slog::warn!(
                    logger,
                    "Replication queue overflowed; shed {} oldest message(s) since last flush",
                    shed
                );
            }
            if batch.is_empty() {
                continue;
            }

            // Failures are already logged per peer; a failed async batch is
            // dropped, not retried.
            let _ = sender.send_to_all(&batch).await;
        }
    }
}
