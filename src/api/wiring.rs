use crate::api::client::{CacheRuntimeMap, ClusterClient};
use crate::api::options::{CoherenceOptions, CoherenceOptionsValidated};
use crate::events::EventBusPublisher;
use crate::membership::{HeartbeatService, HeartbeatTransport, PeerId, PeerRegistry};
use crate::rejoin::{ClusterStoreState, RejoinController, StoreHandle};
use crate::replication::{BatchSender, TcpCachePeerClient};
use crate::server::{self, RpcServer};
use crate::store::{CacheStoreConfig, ClusteredStoreFactory, StoreCreateError};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Depth of the disconnect-signal queue into the rejoin controller. Signals
/// beyond it coalesce anyway.
const DISCONNECT_SIGNAL_QUEUE_DEPTH: usize = 8;

/// How this node learns about its peers.
pub enum DiscoveryMode {
    /// Announce to and listen on a multicast group; silent peers are evicted.
    Multicast { group: SocketAddrV4 },
    /// Same heartbeat protocol pointed at fixed listener addresses, for
    /// networks where multicast is unavailable.
    Unicast {
        heartbeat_bind: SocketAddr,
        targets: Vec<SocketAddr>,
    },
    /// Fixed membership seeded at startup. No heartbeat loops, no eviction.
    Static { peers: Vec<(PeerId, SocketAddr)> },
}

pub struct ClusterConfig {
    pub local_peer_id: String,
    /// Bind address of the peer RPC listener. Port 0 is allowed; the bound
    /// address is available through `ClusterClient::local_rpc_addr`.
    pub rpc_bind_addr: SocketAddr,
    pub discovery: DiscoveryMode,
    pub store_factory: Arc<dyn ClusteredStoreFactory>,
    pub info_logger: slog::Logger,
    pub options: CoherenceOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterClientCreationError {
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Failed to bind the peer RPC listener: {0}")]
    RpcBind(io::Error),
    #[error("Failed to open the discovery sockets: {0}")]
    Discovery(io::Error),
    #[error("Initial cluster attachment failed: {0}")]
    InitialAttachment(StoreCreateError),
}

pub async fn try_create_cluster_client(
    config: ClusterConfig,
) -> Result<ClusterClient, ClusterClientCreationError> {
    let root_logger = config.info_logger;

    let options = CoherenceOptionsValidated::try_from(config.options)
        .map_err(|e| ClusterClientCreationError::IllegalClientOptions(e.to_string()))?;

    let local_peer_id = PeerId::new(config.local_peer_id);

    // Unlike a rejoin, an initial attachment failure is surfaced to the
    // caller; there is no point starting the loops without ever having been
    // connected.
    let initial_store = config
        .store_factory
        .create(HashMap::new())
        .await
        .map_err(ClusterClientCreationError::InitialAttachment)?;
    let (state_tx, state_rx) = watch::channel(ClusterStoreState::Connected(StoreHandle {
        store: initial_store,
        generation: 1,
    }));

    let registry = Arc::new(PeerRegistry::new());
    let events = EventBusPublisher::new(root_logger.clone());
    let caches = CacheRuntimeMap::new();

    let listener = TcpListener::bind(config.rpc_bind_addr)
        .await
        .map_err(ClusterClientCreationError::RpcBind)?;
    let local_rpc_addr = listener
        .local_addr()
        .map_err(ClusterClientCreationError::RpcBind)?;

    let (server_shutdown_handle, server_shutdown_signal) = server::shutdown_signal();
    let rpc_server = RpcServer::new(
        root_logger.new(slog::o!("task" => "rpc-server")),
        caches.clone(),
        state_rx.clone(),
    );
    tokio::task::spawn(rpc_server.run(listener, server_shutdown_signal));

    let heartbeat = match config.discovery {
        DiscoveryMode::Multicast { group } => {
            let transport = HeartbeatTransport::multicast(group)
                .await
                .map_err(ClusterClientCreationError::Discovery)?;
            Some(spawn_heartbeat(
                &root_logger,
                transport,
                local_peer_id.clone(),
                local_rpc_addr,
                registry.clone(),
                events.clone(),
                &options,
            ))
        }
        DiscoveryMode::Unicast {
            heartbeat_bind,
            targets,
        } => {
            let transport = HeartbeatTransport::unicast(heartbeat_bind, targets)
                .await
                .map_err(ClusterClientCreationError::Discovery)?;
            Some(spawn_heartbeat(
                &root_logger,
                transport,
                local_peer_id.clone(),
                local_rpc_addr,
                registry.clone(),
                events.clone(),
                &options,
            ))
        }
        DiscoveryMode::Static { peers } => {
            let now = Instant::now();
            for (peer_id, address) in peers {
                registry.upsert(peer_id, address, now);
            }
            None
        }
    };

    let cache_configs: Arc<RwLock<HashMap<String, CacheStoreConfig>>> =
        Arc::new(RwLock::new(HashMap::new()));
    let (disconnect_tx, disconnect_rx) = mpsc::channel(DISCONNECT_SIGNAL_QUEUE_DEPTH);
    let rejoin_controller = RejoinController::new(
        root_logger.new(slog::o!("task" => "rejoin-controller")),
        local_peer_id.clone(),
        config.store_factory,
        cache_configs.clone(),
        state_tx,
        disconnect_rx,
        events.clone(),
        options.rejoin_retry_delay,
        options.rejoin_log_interval,
        options.dispose_grace,
    );
    tokio::task::spawn(rejoin_controller.run());

    let peer_client = Arc::new(TcpCachePeerClient::new(options.rpc_call_timeout));
    let batch_sender = Arc::new(BatchSender::new(
        root_logger.clone(),
        registry.clone(),
        peer_client.clone(),
    ));

    slog::info!(
        root_logger,
        "Cluster client '{}' up; peer RPC on {}",
        local_peer_id,
        local_rpc_addr
    );

    Ok(ClusterClient {
        logger: root_logger,
        local_peer_id,
        local_rpc_addr,
        caches,
        cache_configs,
        registry,
        events,
        state_rx,
        disconnect_tx,
        peer_client,
        batch_sender,
        async_batch_interval: options.async_batch_interval,
        async_queue_capacity: options.async_queue_capacity,
        nonstop_timeout: options.nonstop_timeout,
        bootstrap_chunk_target_bytes: options.bootstrap_chunk_target_bytes,
        dispose_grace: options.dispose_grace,
        heartbeat,
        server_shutdown: server_shutdown_handle,
    })
}

fn spawn_heartbeat(
    root_logger: &slog::Logger,
    transport: HeartbeatTransport,
    local_peer_id: PeerId,
    local_rpc_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    events: EventBusPublisher,
    options: &CoherenceOptionsValidated,
) -> HeartbeatService {
    HeartbeatService::spawn(
        root_logger.clone(),
        transport,
        local_peer_id,
        local_rpc_addr,
        registry,
        events,
        options.heartbeat_interval,
        options.staleness_timeout,
    )
}
