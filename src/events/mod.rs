mod bus;

pub use bus::ClusterEvent;
pub use bus::ClusterEventListener;
pub use bus::ClusterNode;
pub(crate) use bus::EventBusPublisher;
