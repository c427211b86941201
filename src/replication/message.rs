use crate::wire::{ProtoCacheOperation, ProtoReplicationMessage};
use bytes::Bytes;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheOperation {
    Put,
    Update,
    Remove,
    RemoveAll,
}

/// A serialized description of one cache mutation, bound for peers. Immutable
/// once created; discarded after the send attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationMessage {
    pub cache_name: String,
    pub operation: CacheOperation,
    /// Empty for RemoveAll.
    pub key: String,
    /// Present for Put/Update, absent for removes.
    pub payload: Option<Bytes>,
    /// Strictly increasing per source cache; orders messages for a given
    /// (cache, destination) pair.
    pub sequence: u64,
}

impl ReplicationMessage {
    pub(crate) fn to_proto(&self) -> ProtoReplicationMessage {
        ProtoReplicationMessage {
            cache_name: self.cache_name.clone(),
            operation: ProtoCacheOperation::from(self.operation) as i32,
            key: self.key.clone(),
            payload: self.payload.as_ref().map(|p| p.to_vec()).unwrap_or_default(),
            has_payload: self.payload.is_some(),
            sequence: self.sequence,
        }
    }

    pub(crate) fn from_proto(proto: ProtoReplicationMessage) -> Result<Self, UnknownOperation> {
        let operation = ProtoCacheOperation::from_i32(proto.operation)
            .ok_or(UnknownOperation(proto.operation))?;

        Ok(ReplicationMessage {
            cache_name: proto.cache_name,
            operation: operation.into(),
            key: proto.key,
            payload: if proto.has_payload {
                Some(Bytes::from(proto.payload))
            } else {
                None
            },
            sequence: proto.sequence,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown cache operation code {0}")]
pub struct UnknownOperation(pub i32);

impl From<CacheOperation> for ProtoCacheOperation {
    fn from(op: CacheOperation) -> Self {
        match op {
            CacheOperation::Put => ProtoCacheOperation::Put,
            CacheOperation::Update => ProtoCacheOperation::Update,
            CacheOperation::Remove => ProtoCacheOperation::Remove,
            CacheOperation::RemoveAll => ProtoCacheOperation::RemoveAll,
        }
    }
}

impl From<ProtoCacheOperation> for CacheOperation {
    fn from(op: ProtoCacheOperation) -> Self {
        match op {
            ProtoCacheOperation::Put => CacheOperation::Put,
            ProtoCacheOperation::Update => CacheOperation::Update,
            ProtoCacheOperation::Remove => CacheOperation::Remove,
            ProtoCacheOperation::RemoveAll => CacheOperation::RemoveAll,
        }
    }
}
