// ABOUTME: Type-erased (serialize, deserialize) pairs per method, per the generics-as-closures redesign
// ABOUTME: The multiplexer never sees a concrete message type; it only moves bytes

use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;

/// A marshaller for one message type, erased behind boxed closures so the
/// multiplexer can remain generic-free (spec §9: "model as a per-method
/// object holding boxed (serializer, deserializer) closures").
#[derive(Clone)]
pub struct Marshaller<M> {
    serialize: Arc<dyn Fn(&M) -> Vec<u8> + Send + Sync>,
    deserialize: Arc<dyn Fn(&[u8]) -> Result<M, CodecError> + Send + Sync>,
}

impl<M> fmt::Debug for Marshaller<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marshaller").finish_non_exhaustive()
    }
}

impl<M> Marshaller<M> {
    pub fn new<S, D>(serialize: S, deserialize: D) -> Self
    where
        S: Fn(&M) -> Vec<u8> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<M, CodecError> + Send + Sync + 'static,
    {
        Marshaller {
            serialize: Arc::new(serialize),
            deserialize: Arc::new(deserialize),
        }
    }

    pub fn encode(&self, message: &M) -> Vec<u8> {
        (self.serialize)(message)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<M, CodecError> {
        (self.deserialize)(bytes)
    }
}

/// A marshaller for `Vec<u8>` that passes bytes through unchanged. Useful
/// for tests and for callers who have already serialized their message with
/// an external protobuf/prost codec.
pub fn identity_marshaller() -> Marshaller<Vec<u8>> {
    Marshaller::new(|m: &Vec<u8>| m.clone(), |b: &[u8]| Ok(b.to_vec()))
}
