mod server;

pub(crate) use server::shutdown_signal;
pub(crate) use server::RpcServer;
pub(crate) use server::RpcServerShutdownHandle;
pub(crate) use server::RpcServerShutdownSignal;
