mod heartbeat;
mod registry;

pub(crate) use heartbeat::HeartbeatService;
pub(crate) use heartbeat::HeartbeatTransport;
pub use registry::Peer;
pub use registry::PeerId;
pub(crate) use registry::PeerRegistry;
