use crate::replication::message::ReplicationMessage;
use crate::store::Element;
use crate::wire::{
    proto_request, proto_response, write_frame, read_frame, FrameError, ProtoBatch,
    ProtoGetElementsReq, ProtoListKeysReq, ProtoRequest, ProtoResponse,
};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum PeerRpcError {
    #[error("failed to connect to peer: {0}")]
    Connect(io::Error),
    #[error("rpc call timed out")]
    Timeout,
    #[error("wire failure: {0}")]
    Frame(#[from] FrameError),
    #[error("peer closed connection mid-call")]
    ConnectionClosed,
    #[error("peer reported: {0}")]
    Remote(String),
    #[error("peer sent an unexpected response variant")]
    UnexpectedResponse,
}

/// Point-to-point RPC surface of a remote peer. A trait so tests can stand in
/// unreachable, slow, or scripted peers without sockets.
#[async_trait::async_trait]
pub(crate) trait CachePeerClient: Send + Sync {
    async fn receive_batch(
        &self,
        peer_addr: SocketAddr,
        messages: &[ReplicationMessage],
    ) -> Result<(), PeerRpcError>;

    async fn list_keys(
        &self,
        peer_addr: SocketAddr,
        cache_name: &str,
    ) -> Result<Vec<String>, PeerRpcError>;

    async fn get_elements(
        &self,
        peer_addr: SocketAddr,
        cache_name: &str,
        keys: &[String],
    ) -> Result<Vec<Element>, PeerRpcError>;
}

/// Stateless TCP implementation: one connection per call, bounded by
/// `call_timeout` across connect + roundtrip.
pub(crate) struct TcpCachePeerClient {
    call_timeout: Duration,
}

impl TcpCachePeerClient {
    pub fn new(call_timeout: Duration) -> Self {
        TcpCachePeerClient { call_timeout }
    }

    async fn call(
        &self,
        peer_addr: SocketAddr,
        request: ProtoRequest,
    ) -> Result<ProtoResponse, PeerRpcError> {
        let roundtrip = async {
            let mut stream = TcpStream::connect(peer_addr)
                .await
                .map_err(PeerRpcError::Connect)?;
            write_frame(&mut stream, &request).await?;
            let response: ProtoResponse = read_frame(&mut stream)
                .await?
                .ok_or(PeerRpcError::ConnectionClosed)?;
            Ok(response)
        };

        match tokio::time::timeout(self.call_timeout, roundtrip).await {
            Ok(result) => result,
            Err(_) => Err(PeerRpcError::Timeout),
        }
    }
}

#[async_trait::async_trait]
impl CachePeerClient for TcpCachePeerClient {
    async fn receive_batch(
        &self,
        peer_addr: SocketAddr,
        messages: &[ReplicationMessage],
    ) -> Result<(), PeerRpcError> {
        let batch = ProtoBatch {
            messages: messages.iter().map(|m| m.to_proto()).collect(),
        };
        let request = ProtoRequest {
            req: Some(proto_request::Req::ReceiveBatch(batch)),
        };

        match self.call(peer_addr, request).await?.resp {
            Some(proto_response::Resp::Ack(_)) => Ok(()),
            Some(proto_response::Resp::Error(e)) => Err(PeerRpcError::Remote(e.message)),
            _ => Err(PeerRpcError::UnexpectedResponse),
        }
    }

    async fn list_keys(
        &self,
        peer_addr: SocketAddr,
        cache_name: &str,
    ) -> Result<Vec<String>, PeerRpcError> {
        let request = ProtoRequest {
            req: Some(proto_request::Req::ListKeys(ProtoListKeysReq {
                cache_name: cache_name.to_string(),
            })),
        };

        match self.call(peer_addr, request).await?.resp {
            Some(proto_response::Resp::Keys(key_list)) => Ok(key_list.keys),
            Some(proto_response::Resp::Error(e)) => Err(PeerRpcError::Remote(e.message)),
            _ => Err(PeerRpcError::UnexpectedResponse),
        }
    }

    async fn get_elements(
        &self,
        peer_addr: SocketAddr,
        cache_name: &str,
        keys: &[String],
    ) -> Result<Vec<Element>, PeerRpcError> {
        let request = ProtoRequest {
            req: Some(proto_request::Req::GetElements(ProtoGetElementsReq {
                cache_name: cache_name.to_string(),
                keys: keys.to_vec(),
            })),
        };

        match self.call(peer_addr, request).await?.resp {
            Some(proto_response::Resp::Elements(element_list)) => Ok(element_list
                .elements
                .into_iter()
                .map(|e| Element::serialized(e.key, Bytes::from(e.payload)))
                .collect()),
            Some(proto_response::Resp::Error(e)) => Err(PeerRpcError::Remote(e.message)),
            _ => Err(PeerRpcError::UnexpectedResponse),
        }
    }
}
