use crate::api::CacheRuntimeMap;
use crate::rejoin::ClusterStoreState;
use crate::replication::{CacheOperation, ReplicationMessage};
use crate::store::Element;
use crate::wire::{
    proto_request, proto_response, read_frame, write_frame, ProtoBatch, ProtoElement,
    ProtoElementList, ProtoGetElementsReq, ProtoKeyList, ProtoListKeysReq, ProtoRequest,
    ProtoResponse, ProtoRpcError,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

/// While the handle lives, the server keeps accepting; dropping it (or the
/// whole client) resolves the signal and the accept loop exits.
pub(crate) struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

/// The receiving half doubles as the future the accept loop selects on: a
/// dropped sender and a sent value both read as "stop".
pub(crate) type RpcServerShutdownSignal = oneshot::Receiver<()>;

pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();
    (RpcServerShutdownHandle { _tx: tx }, rx)
}

/// Listener endpoint of this node's peer RPC surface: accepts replication
/// batches and serves bootstrap reads to joining peers.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    caches: CacheRuntimeMap,
    state_rx: watch::Receiver<ClusterStoreState>,
}

impl RpcServer {
    pub fn new(
        logger: slog::Logger,
        caches: CacheRuntimeMap,
        state_rx: watch::Receiver<ClusterStoreState>,
    ) -> Self {
        RpcServer {
            logger,
            caches,
            state_rx,
        }
    }

    pub async fn run(self, listener: TcpListener, mut shutdown_signal: RpcServerShutdownSignal) {
        match listener.local_addr() {
            Ok(addr) => slog::info!(self.logger, "Peer RPC listening on {}", addr),
            Err(_) => slog::info!(self.logger, "Peer RPC listening"),
        }

        let server = Arc::new(self);
        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    slog::info!(server.logger, "Peer RPC server shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let server = server.clone();
                            tokio::task::spawn(async move {
                                server.handle_connection(stream, remote_addr).await;
                            });
                        }
                        Err(e) => {
                            slog::warn!(server.logger, "Failed to accept peer connection: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, remote_addr: std::net::SocketAddr) {
        loop {
            let request: ProtoRequest = match read_frame(&mut stream).await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    slog::warn!(
                        self.logger,
                        "Closing connection from {} on bad frame: {}",
                        remote_addr,
                        e
                    );
                    return;
                }
            };

            let response = match request.req {
                Some(proto_request::Req::ReceiveBatch(batch)) => self.handle_batch(batch).await,
                Some(proto_request::Req::ListKeys(req)) => self.handle_list_keys(req).await,
                Some(proto_request::Req::GetElements(req)) => self.handle_get_elements(req).await,
                None => error_response("empty request"),
            };

            if let Err(e) = write_frame(&mut stream, &response).await {
                slog::warn!(
                    self.logger,
                    "Failed to respond to {}, closing connection: {}",
                    remote_addr,
                    e
                );
                return;
            }
        }
    }

    /// Applies a peer's mutations in frame order. Application is local-only:
    /// nothing here goes back through a propagator, so events cannot echo
    /// between nodes forever.
    async fn handle_batch(&self, batch: ProtoBatch) -> ProtoResponse {
        for proto_message in batch.messages {
            let message = match ReplicationMessage::from_proto(proto_message) {
                Ok(message) => message,
                Err(e) => {
                    slog::warn!(self.logger, "Skipping undecodable replication message: {}", e);
                    continue;
                }
            };
            self.apply(message).await;
        }

        ProtoResponse {
            resp: Some(proto_response::Resp::Ack(true)),
        }
    }

    async fn apply(&self, message: ReplicationMessage) {
        let runtime = match self.caches.lookup(&message.cache_name) {
            Some(runtime) => runtime,
            None => {
                slog::debug!(
                    self.logger,
                    "Ignoring replication for unregistered cache '{}'",
                    message.cache_name
                );
                return;
            }
        };

        let handle = match &*self.state_rx.borrow() {
            ClusterStoreState::Connected(handle) => handle.clone(),
            _ => {
                // Mid-rejoin; this node is stale anyway and will be repaired
                // by bootstrap once reattached.
                slog::info!(
                    self.logger,
                    "Dropping replication for '{}' while store is unavailable",
                    message.cache_name
                );
                return;
            }
        };

        let result = match message.operation {
            CacheOperation::Put | CacheOperation::Update => {
                let payload = message.payload.clone().unwrap_or_else(Bytes::new);
                let element = Element::serialized(message.key.clone(), payload);
                if let Some(fallback) = &runtime.fallback {
                    fallback.put(element.clone());
                }
                handle
                    .store
                    .put(&message.cache_name, element)
                    .await
                    .map(|_| ())
            }
            CacheOperation::Remove => {
                if let Some(fallback) = &runtime.fallback {
                    fallback.remove(&message.key);
                }
                handle
                    .store
                    .remove(&message.cache_name, &message.key)
                    .await
                    .map(|_| ())
            }
            CacheOperation::RemoveAll => {
                if let Some(fallback) = &runtime.fallback {
                    fallback.clear();
                }
                handle.store.remove_all(&message.cache_name).await
            }
        };

        if let Err(e) = result {
            slog::warn!(
                self.logger,
                "Failed to apply replicated {:?} to cache '{}': {}",
                message.operation,
                message.cache_name,
                e
            );
        }
    }

    async fn handle_list_keys(&self, request: ProtoListKeysReq) -> ProtoResponse {
        if self.caches.lookup(&request.cache_name).is_none() {
            return error_response(&format!("cache '{}' not registered", request.cache_name));
        }

        let handle = match &*self.state_rx.borrow() {
            ClusterStoreState::Connected(handle) => handle.clone(),
            _ => return error_response("store unavailable"),
        };

        match handle.store.keys(&request.cache_name).await {
            Ok(keys) => ProtoResponse {
                resp: Some(proto_response::Resp::Keys(ProtoKeyList { keys })),
            },
            Err(e) => error_response(&e.to_string()),
        }
    }

    async fn handle_get_elements(&self, request: ProtoGetElementsReq) -> ProtoResponse {
        if self.caches.lookup(&request.cache_name).is_none() {
            return error_response(&format!("cache '{}' not registered", request.cache_name));
        }

        let handle = match &*self.state_rx.borrow() {
            ClusterStoreState::Connected(handle) => handle.clone(),
            _ => return error_response("store unavailable"),
        };

        let mut elements = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            match handle.store.get(&request.cache_name, key).await {
                // Transient payloads stay local; vanished keys are skipped.
                Ok(Some(element)) => {
                    if let Some(payload) = element.payload_bytes() {
                        elements.push(ProtoElement {
                            key: element.key.clone(),
                            payload: payload.to_vec(),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => return error_response(&e.to_string()),
            }
        }

        ProtoResponse {
            resp: Some(proto_response::Resp::Elements(ProtoElementList { elements })),
        }
    }
}

fn error_response(message: &str) -> ProtoResponse {
    ProtoResponse {
        resp: Some(proto_response::Resp::Error(ProtoRpcError {
            message: message.to_string(),
        })),
    }
}
