//! Serialization boundary.
//!
//! The engine treats encoding as opaque: an [`OperationCodec`] turns an
//! [`Operation`] into bytes and back, failing on malformed input. Versioned
//! field layouts belong to the codec, not to the engine.
//!
//! [`JsonCodec`] is the default and what the tests use.
//!
//! # Example
//!
//! ```rust
//! use node_engine::codec::{JsonCodec, OperationCodec};
//! use node_engine::Operation;
//!
//! let codec = JsonCodec;
//! let op = Operation::new("counter", "get").with_partition(3);
//! let bytes = codec.encode(&op).unwrap();
//! let back = codec.decode(&bytes).unwrap();
//! assert_eq!(back.partition_id, Some(3));
//! ```

use crate::error::{EngineError, Result};
use crate::operation::Operation;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes and decodes operations for the wire.
pub trait OperationCodec: Send + Sync + 'static {
    fn encode(&self, op: &Operation) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<Operation>;
}

/// serde_json-backed codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl OperationCodec for JsonCodec {
    fn encode(&self, op: &Operation) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(op)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Operation> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode an engine-internal payload (response envelopes, backup entries,
/// registrations) carried inside an operation.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(EngineError::from)
}

/// Decode an engine-internal payload.
pub fn from_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(EngineError::from)
}
