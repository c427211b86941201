mod api;
mod in_memory;

pub use api::CacheStoreConfig;
pub use api::ClusteredStore;
pub use api::ClusteredStoreFactory;
pub use api::Element;
pub use api::ElementPayload;
pub use api::StoreCreateError;
pub use api::StoreError;
pub use in_memory::InMemoryClusteredStore;
pub use in_memory::InMemoryStoreFactory;
