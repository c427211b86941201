mod loader;

pub use loader::BootstrapError;
pub(crate) use loader::BootstrapLoader;
pub use loader::BootstrapReport;
