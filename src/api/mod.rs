//! This mod holds the library's client-facing API.
mod client;
mod options;
mod wiring;

pub use client::AddCacheError;
pub use client::CacheOpError;
pub use client::CacheReplicationConfig;
pub use client::ClusterClient;
pub use client::ReplicatedCache;
pub use client::ReplicationMode;
pub use options::CoherenceOptions;
pub use wiring::try_create_cluster_client;
pub use wiring::ClusterClientCreationError;
pub use wiring::ClusterConfig;
pub use wiring::DiscoveryMode;

// So the RPC server can resolve incoming replication against cache runtimes.
pub(crate) use client::CacheRuntimeMap;
