use crate::store::ClusteredStore;
use std::fmt;
use std::sync::Arc;

/// The active clustered store plus the attachment generation it belongs to.
/// Exactly one handle is current at a time; a rejoin swaps it atomically via
/// the state watch channel and bumps the generation.
#[derive(Clone)]
pub struct StoreHandle {
    pub store: Arc<dyn ClusteredStore>,
    pub generation: u64,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Lifecycle of the cluster attachment. Owned exclusively by the rejoin
/// controller; everyone else reads snapshots through a watch receiver.
#[derive(Clone, Debug)]
pub(crate) enum ClusterStoreState {
    Connected(StoreHandle),
    Disconnected,
    Rejoining,
}

impl ClusterStoreState {
    pub fn rejoin_state(&self) -> RejoinState {
        match self {
            ClusterStoreState::Connected(_) => RejoinState::Connected,
            ClusterStoreState::Disconnected => RejoinState::Disconnected,
            ClusterStoreState::Rejoining => RejoinState::Rejoining,
        }
    }
}

/// Externally observable recovery state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejoinState {
    Connected,
    Disconnected,
    Rejoining,
}
