//! Wire types for the heartbeat datagrams and the peer RPC frames.
//!
//! Messages are prost-encoded. RPC frames are length-prefixed (u32 big-endian)
//! on a plain TCP stream; heartbeats are single UDP datagrams.

mod frame;
mod messages;

pub(crate) use frame::read_frame;
pub(crate) use frame::write_frame;
pub(crate) use frame::FrameError;
pub(crate) use messages::proto_request;
pub(crate) use messages::proto_response;
pub(crate) use messages::ProtoBatch;
pub(crate) use messages::ProtoCacheOperation;
pub(crate) use messages::ProtoElement;
pub(crate) use messages::ProtoElementList;
pub(crate) use messages::ProtoGetElementsReq;
pub(crate) use messages::ProtoHeartbeat;
pub(crate) use messages::ProtoKeyList;
pub(crate) use messages::ProtoListKeysReq;
pub(crate) use messages::ProtoReplicationMessage;
pub(crate) use messages::ProtoRequest;
pub(crate) use messages::ProtoResponse;
pub(crate) use messages::ProtoRpcError;
