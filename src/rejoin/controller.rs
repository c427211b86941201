use crate::events::{ClusterEvent, ClusterNode, EventBusPublisher};
use crate::membership::PeerId;
use crate::rejoin::state::{ClusterStoreState, StoreHandle};
use crate::store::{CacheStoreConfig, ClusteredStoreFactory};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

enum LoopOutcome {
    Recovered,
    Shutdown,
}

/// Reacts to cluster-disconnect signals: disposes the dead store, recreates it
/// through the factory until that succeeds (forever), and swaps the published
/// handle. Runs as a single task; concurrent signals coalesce into one
/// recovery cycle, so exactly one ClusterRejoined fires per outage.
pub(crate) struct RejoinController {
    logger: slog::Logger,
    local_peer_id: PeerId,
    factory: Arc<dyn ClusteredStoreFactory>,
    cache_configs: Arc<RwLock<HashMap<String, CacheStoreConfig>>>,
    state_tx: watch::Sender<ClusterStoreState>,
    signal_rx: mpsc::Receiver<()>,
    events: EventBusPublisher,
    retry_delay: Duration,
    log_interval: Duration,
    dispose_grace: Duration,
}

impl RejoinController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: slog::Logger,
        local_peer_id: PeerId,
        factory: Arc<dyn ClusteredStoreFactory>,
        cache_configs: Arc<RwLock<HashMap<String, CacheStoreConfig>>>,
        state_tx: watch::Sender<ClusterStoreState>,
        signal_rx: mpsc::Receiver<()>,
        events: EventBusPublisher,
        retry_delay: Duration,
        log_interval: Duration,
        dispose_grace: Duration,
    ) -> Self {
        RejoinController {
            logger,
            local_peer_id,
            factory,
            cache_configs,
            state_tx,
            signal_rx,
            events,
            retry_delay,
            log_interval,
            dispose_grace,
        }
    }

    /// Runs until every disconnect-signal sender is dropped (shutdown).
    pub async fn run(mut self) {
        loop {
            match self.signal_rx.recv().await {
                None => return,
                Some(()) => {
                    let old_handle = match &*self.state_tx.borrow() {
                        ClusterStoreState::Connected(handle) => handle.clone(),
                        // Recovery already in flight; coalesce.
                        _ => continue,
                    };
                    match self.recover(old_handle).await {
                        LoopOutcome::Recovered => {}
                        LoopOutcome::Shutdown => return,
                    }
                }
            }
        }
    }

    async fn recover(&mut self, old_handle: StoreHandle) -> LoopOutcome {
        slog::warn!(
            self.logger,
            "Cluster connectivity lost (generation {}); starting rejoin",
            old_handle.generation
        );

        let _ = self.state_tx.send(ClusterStoreState::Disconnected);
        self.events.broadcast(ClusterEvent::ClusterOffline);
        let _ = self.state_tx.send(ClusterStoreState::Rejoining);

        // The dead store is released exactly once, before recovery completes,
        // so repeated rejoin cycles cannot leak remote resources.
        self.dispose_old(&old_handle).await;

        let old_node = ClusterNode {
            peer_id: self.local_peer_id.clone(),
            generation: old_handle.generation,
        };

        let mut attempts: u64 = 0;
        let mut last_failure_log: Option<Instant> = None;
        loop {
            attempts += 1;
            let configs = self.cache_configs.read().unwrap().clone();

            match self.factory.create(configs).await {
                Ok(store) => {
                    // Signals that landed while create() was in flight belong
                    // to this outage; absorb them before the new handle
                    // becomes visible, or they would start a second cycle.
                    while self.signal_rx.try_recv().is_ok() {}

                    let new_handle = StoreHandle {
                        store,
                        generation: old_handle.generation + 1,
                    };
                    let new_node = ClusterNode {
                        peer_id: self.local_peer_id.clone(),
                        generation: new_handle.generation,
                    };
                    slog::info!(
                        self.logger,
                        "Rejoined cluster after {} attempt(s); now at generation {}",
                        attempts,
                        new_handle.generation
                    );

                    let _ = self.state_tx.send(ClusterStoreState::Connected(new_handle));
                    self.events.broadcast(ClusterEvent::ClusterRejoined {
                        old_node,
                        new_node,
                    });
                    self.events.broadcast(ClusterEvent::ClusterOnline);
                    return LoopOutcome::Recovered;
                }
                Err(e) => {
                    // Store creation failure is always recoverable; log
                    // rate-limited and retry forever.
                    let should_log = last_failure_log
                        .map(|at| at.elapsed() >= self.log_interval)
                        .unwrap_or(true);
                    if should_log {
                        slog::info!(
                            self.logger,
                            "Rejoin attempt {} failed, will keep retrying every {:?}: {}",
                            attempts,
                            self.retry_delay,
                            e
                        );
                        last_failure_log = Some(Instant::now());
                    }

                    if let LoopOutcome::Shutdown = self.retry_pause().await {
                        return LoopOutcome::Shutdown;
                    }
                }
            }
        }
    }

    /// Sleeps one retry delay. Signals landing during the pause are absorbed
    /// (the cycle already covers them); sender closure means shutdown.
    async fn retry_pause(&mut self) -> LoopOutcome {
        let deadline = Instant::now() + self.retry_delay;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return LoopOutcome::Recovered,
                signal = self.signal_rx.recv() => match signal {
                    Some(()) => continue,
                    None => return LoopOutcome::Shutdown,
                },
            }
        }
    }

    async fn dispose_old(&self, old_handle: &StoreHandle) {
        match time::timeout(self.dispose_grace, old_handle.store.dispose()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                slog::warn!(
                    self.logger,
                    "Disposing store of generation {} failed: {}",
                    old_handle.generation,
                    e
                );
            }
            Err(_) => {
                slog::warn!(
                    self.logger,
                    "Disposal of store generation {} did not finish within {:?}; abandoning it",
                    old_handle.generation,
                    self.dispose_grace
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClusteredStore, Element, StoreCreateError, StoreError};
    use slog::Drain;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard.fuse(), slog::o!())
    }

    struct CountingStore {
        dispose_count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ClusteredStore for CountingStore {
        async fn get(&self, _cache: &str, _key: &str) -> Result<Option<Element>, StoreError> {
            Ok(None)
        }
        async fn put(&self, _cache: &str, _element: Element) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn remove(&self, _cache: &str, _key: &str) -> Result<Option<Element>, StoreError> {
            Ok(None)
        }
        async fn remove_all(&self, _cache: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn keys(&self, _cache: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        async fn dispose(&self) -> Result<(), StoreError> {
            self.dispose_count.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    /// Fails `failures_remaining` create calls, then succeeds forever. Each
    /// call takes `create_delay` to complete.
    struct FlakyFactory {
        failures_remaining: AtomicUsize,
        create_count: Arc<AtomicUsize>,
        dispose_count: Arc<AtomicUsize>,
        create_delay: Duration,
    }

    #[async_trait::async_trait]
    impl ClusteredStoreFactory for FlakyFactory {
        async fn create(
            &self,
            _cache_configs: HashMap<String, CacheStoreConfig>,
        ) -> Result<Arc<dyn ClusteredStore>, StoreCreateError> {
            self.create_count.fetch_add(1, Ordering::AcqRel);
            time::sleep(self.create_delay).await;
            let remaining = self.failures_remaining.load(Ordering::Acquire);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::Release);
                return Err(StoreCreateError::RuntimeUnavailable(
                    "clustered runtime not detected".to_string(),
                ));
            }
            Ok(Arc::new(CountingStore {
                dispose_count: self.dispose_count.clone(),
            }))
        }
    }

    struct Harness {
        signal_tx: mpsc::Sender<()>,
        state_rx: watch::Receiver<ClusterStoreState>,
        events: crate::events::ClusterEventListener,
        create_count: Arc<AtomicUsize>,
        dispose_count: Arc<AtomicUsize>,
    }

    fn start_controller(initial_failures: usize) -> Harness {
        start_controller_with_create_delay(initial_failures, Duration::from_millis(0))
    }

    fn start_controller_with_create_delay(
        initial_failures: usize,
        create_delay: Duration,
    ) -> Harness {
        let create_count = Arc::new(AtomicUsize::new(0));
        let dispose_count = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(FlakyFactory {
            failures_remaining: AtomicUsize::new(initial_failures),
            create_count: create_count.clone(),
            dispose_count: dispose_count.clone(),
            create_delay,
        });

        let initial = StoreHandle {
            store: Arc::new(CountingStore {
                dispose_count: dispose_count.clone(),
            }),
            generation: 1,
        };
        let (state_tx, state_rx) = watch::channel(ClusterStoreState::Connected(initial));
        let (signal_tx, signal_rx) = mpsc::channel(8);

        let bus = EventBusPublisher::new(test_logger());
        let events = bus.subscribe();

        let controller = RejoinController::new(
            test_logger(),
            PeerId::new("node-1"),
            factory,
            Arc::new(RwLock::new(HashMap::new())),
            state_tx,
            signal_rx,
            bus,
            Duration::from_millis(20),
            Duration::from_secs(30),
            Duration::from_millis(500),
        );
        tokio::task::spawn(controller.run());

        Harness {
            signal_tx,
            state_rx,
            events,
            create_count,
            dispose_count,
        }
    }

    async fn await_connected(state_rx: &mut watch::Receiver<ClusterStoreState>) -> StoreHandle {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let connected = match &*state_rx.borrow() {
                ClusterStoreState::Connected(h) => Some(h.clone()),
                _ => None,
            };
            if let Some(handle) = connected {
                return handle;
            }
            tokio::time::timeout_at(deadline, state_rx.changed())
                .await
                .expect("controller never reconnected")
                .expect("controller dropped state channel");
        }
    }

    #[tokio::test]
    async fn retries_until_create_succeeds_and_bumps_generation() {
        let mut h = start_controller(3);

        h.signal_tx.send(()).await.unwrap();
        // Wait until it leaves Connected, then until it is Connected again.
        h.state_rx.changed().await.unwrap();
        let handle = await_connected(&mut h.state_rx).await;

        assert_eq!(handle.generation, 2);
        assert!(h.create_count.load(Ordering::Acquire) >= 4);
        assert_eq!(h.dispose_count.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn exactly_one_rejoined_event_despite_concurrent_signals() {
        let mut h = start_controller(2);

        for _ in 0..5 {
            h.signal_tx.send(()).await.unwrap();
        }
        h.state_rx.changed().await.unwrap();
        await_connected(&mut h.state_rx).await;
        // Allow any (incorrect) second cycle a chance to surface.
        time::sleep(Duration::from_millis(200)).await;

        let mut offline = 0;
        let mut rejoined = 0;
        let mut online = 0;
        while let Some(event) = h.events.try_next_event() {
            match event {
                ClusterEvent::ClusterOffline => offline += 1,
                ClusterEvent::ClusterRejoined { old_node, new_node } => {
                    assert_eq!(old_node.generation, 1);
                    assert_eq!(new_node.generation, 2);
                    rejoined += 1;
                }
                ClusterEvent::ClusterOnline => online += 1,
                _ => {}
            }
        }
        assert_eq!(offline, 1);
        assert_eq!(rejoined, 1);
        assert_eq!(online, 1);
        assert_eq!(h.dispose_count.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn signal_during_store_creation_coalesces_into_one_cycle() {
        let mut h = start_controller_with_create_delay(0, Duration::from_millis(150));

        h.signal_tx.send(()).await.unwrap();
        // Let the controller enter create(), then signal again mid-flight.
        time::sleep(Duration::from_millis(50)).await;
        h.signal_tx.send(()).await.unwrap();

        h.state_rx.changed().await.unwrap();
        let handle = await_connected(&mut h.state_rx).await;
        assert_eq!(handle.generation, 2);

        // Give any (incorrect) second cycle time to run.
        time::sleep(Duration::from_millis(400)).await;

        let mut rejoined = 0;
        while let Some(event) = h.events.try_next_event() {
            if let ClusterEvent::ClusterRejoined { .. } = event {
                rejoined += 1;
            }
        }
        assert_eq!(rejoined, 1, "one outage must produce one ClusterRejoined");
        assert_eq!(h.dispose_count.load(Ordering::Acquire), 1);
        let connected = match &*h.state_rx.borrow() {
            ClusterStoreState::Connected(h) => h.generation,
            other => panic!("expected Connected, got {:?}", other),
        };
        assert_eq!(connected, 2, "the recovered store must not be replaced");
    }

    #[tokio::test]
    async fn second_outage_produces_second_cycle() {
        let mut h = start_controller(0);

        h.signal_tx.send(()).await.unwrap();
        h.state_rx.changed().await.unwrap();
        let first = await_connected(&mut h.state_rx).await;
        assert_eq!(first.generation, 2);

        h.signal_tx.send(()).await.unwrap();
        h.state_rx.changed().await.unwrap();
        let second = await_connected(&mut h.state_rx).await;
        assert_eq!(second.generation, 3);

        assert_eq!(h.dispose_count.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn dropping_signal_senders_stops_retry_loop() {
        let h = start_controller(usize::MAX);

        h.signal_tx.send(()).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;
        let before = h.create_count.load(Ordering::Acquire);
        assert!(before > 0, "retry loop should have started");

        drop(h.signal_tx);
        // One retry delay for the loop to notice, plus slack.
        time::sleep(Duration::from_millis(200)).await;
        let after = h.create_count.load(Ordering::Acquire);
        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            after,
            h.create_count.load(Ordering::Acquire),
            "retry loop must stop after shutdown"
        );
    }
}
