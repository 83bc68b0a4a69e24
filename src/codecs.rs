//! Pluggable payload codecs.
//!
//! The crate does not ship any implementation: applications plug in the serialization format,
//! compression algorithm and cipher of their choice.
//! [`CompressionMiddleware`](crate::publishers::CompressionMiddleware) and
//! [`EncryptionMiddleware`](crate::publishers::EncryptionMiddleware) apply them on the way out,
//! [`ConsumerDataflow`](crate::dataflow::ConsumerDataflow) reverses them on the way in.
use serde::{de::DeserializeOwned, Serialize};

/// Turns typed values into payloads and back.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, anyhow::Error>;

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, anyhow::Error>;
}

pub trait Compressor: Send + Sync + 'static {
    /// Recorded in the `x-compressed` metadata of compressed messages.
    fn name(&self) -> &str;

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error>;

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error>;
}

pub trait Encryptor: Send + Sync + 'static {
    /// Recorded in the `x-encrypted` metadata of encrypted messages.
    fn name(&self) -> &str;

    fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error>;

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error>;
}
