//! Serialization protocols for persisted checkpoint records

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Protocol for turning checkpoint records into bytes and back
///
/// Used by [`crate::FileCheckpointSaver`]; the record types it writes avoid
/// self-describing-only serde features so both implementations here work.
pub trait SerializerProtocol: Send + Sync {
    /// File extension for records written with this serializer
    fn extension(&self) -> &'static str;

    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// JSON-based serializer (default, human-inspectable)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl SerializerProtocol for JsonSerializer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Compact binary serializer using bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl SerializerProtocol for BincodeSerializer {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}
