/// Liveness announcement broadcast on the discovery channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHeartbeat {
    #[prost(string, tag = "1")]
    pub peer_id: ::prost::alloc::string::String,
    /// The announcing node's peer RPC address, e.g. "10.0.0.3:40010".
    #[prost(string, tag = "2")]
    pub address: ::prost::alloc::string::String,
    /// Sender wall clock, milliseconds since epoch. Informational only; the
    /// receiver tracks liveness against its own clock.
    #[prost(int64, tag = "3")]
    pub sent_at_millis: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoCacheOperation {
    Put = 0,
    Update = 1,
    Remove = 2,
    RemoveAll = 3,
}

/// One replicated cache mutation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReplicationMessage {
    #[prost(string, tag = "1")]
    pub cache_name: ::prost::alloc::string::String,
    #[prost(enumeration = "ProtoCacheOperation", tag = "2")]
    pub operation: i32,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    /// Distinguishes an absent payload (removes) from an empty one.
    #[prost(bool, tag = "5")]
    pub has_payload: bool,
    #[prost(uint64, tag = "6")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoBatch {
    #[prost(message, repeated, tag = "1")]
    pub messages: ::prost::alloc::vec::Vec<ProtoReplicationMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoListKeysReq {
    #[prost(string, tag = "1")]
    pub cache_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoGetElementsReq {
    #[prost(string, tag = "1")]
    pub cache_name: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoElement {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequest {
    #[prost(oneof = "proto_request::Req", tags = "1, 2, 3")]
    pub req: ::core::option::Option<proto_request::Req>,
}

pub mod proto_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Req {
        #[prost(message, tag = "1")]
        ReceiveBatch(super::ProtoBatch),
        #[prost(message, tag = "2")]
        ListKeys(super::ProtoListKeysReq),
        #[prost(message, tag = "3")]
        GetElements(super::ProtoGetElementsReq),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoKeyList {
    #[prost(string, repeated, tag = "1")]
    pub keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoElementList {
    #[prost(message, repeated, tag = "1")]
    pub elements: ::prost::alloc::vec::Vec<ProtoElement>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRpcError {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoResponse {
    #[prost(oneof = "proto_response::Resp", tags = "1, 2, 3, 4")]
    pub resp: ::core::option::Option<proto_response::Resp>,
}

pub mod proto_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Resp {
        /// Acknowledges a ReceiveBatch call.
        #[prost(bool, tag = "1")]
        Ack(bool),
        #[prost(message, tag = "2")]
        Keys(super::ProtoKeyList),
        #[prost(message, tag = "3")]
        Elements(super::ProtoElementList),
        #[prost(message, tag = "4")]
        Error(super::ProtoRpcError),
    }
}
