mod api;
mod bootstrap;
mod events;
mod membership;
mod rejoin;
mod replication;
mod server;
mod stop_signal;
mod store;
mod wire;

pub use api::try_create_cluster_client;
pub use api::AddCacheError;
pub use api::CacheOpError;
pub use api::CacheReplicationConfig;
pub use api::ClusterClient;
pub use api::ClusterClientCreationError;
pub use api::ClusterConfig;
pub use api::CoherenceOptions;
pub use api::DiscoveryMode;
pub use api::ReplicatedCache;
pub use api::ReplicationMode;

pub use bootstrap::BootstrapError;
pub use bootstrap::BootstrapReport;

pub use events::ClusterEvent;
pub use events::ClusterEventListener;
pub use events::ClusterNode;

pub use membership::Peer;
pub use membership::PeerId;

pub use rejoin::ClusterUnavailableError;
pub use rejoin::NonStopPolicy;
pub use rejoin::RejoinState;
pub use rejoin::StoreHandle;

pub use replication::CacheOperation;
pub use replication::PeerRpcError;
pub use replication::PropagationError;
pub use replication::ReplicationMessage;

pub use store::CacheStoreConfig;
pub use store::ClusteredStore;
pub use store::ClusteredStoreFactory;
pub use store::Element;
pub use store::ElementPayload;
pub use store::InMemoryClusteredStore;
pub use store::InMemoryStoreFactory;
pub use store::StoreCreateError;
pub use store::StoreError;
