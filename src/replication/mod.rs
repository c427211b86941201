mod channel;
mod message;
mod peer_client;
mod propagator;

pub(crate) use channel::AsyncDispatcher;
pub(crate) use channel::AsyncReplicationQueue;
pub(crate) use channel::BatchSender;
pub use channel::PropagationError;
pub use message::CacheOperation;
pub use message::ReplicationMessage;
pub(crate) use peer_client::CachePeerClient;
pub use peer_client::PeerRpcError;
pub(crate) use peer_client::TcpCachePeerClient;
pub(crate) use propagator::EventPropagator;
