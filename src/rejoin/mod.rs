mod controller;
mod gate;
mod state;

pub(crate) use controller::RejoinController;
pub use gate::ClusterUnavailableError;
pub(crate) use gate::GateDecision;
pub(crate) use gate::LocalFallbackCache;
pub(crate) use gate::NonStopOperationGate;
pub use gate::NonStopPolicy;
pub use state::RejoinState;
pub use state::StoreHandle;
pub(crate) use state::ClusterStoreState;
