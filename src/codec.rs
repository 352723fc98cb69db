//! Value serialization with transparent compression
//!
//! Values are serialized with serde_json. Payloads above a size threshold
//! are zlib-compressed and prefixed with a short fixed marker so `decode`
//! can tell compressed from raw payloads apart. A serialized JSON document
//! can never start with the marker bytes (strings start with `"`), so the
//! prefix is unambiguous.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marker prepended to compressed payloads.
const COMPRESS_FLAG: &[u8] = b"zip:";

/// Payloads longer than this (serialized) get compressed.
const COMPRESS_THRESHOLD: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Corrupt payloads are treated as a cache miss by the clients, never as
    /// a fatal error.
    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

/// Serializes values to backend bytes and back.
#[derive(Debug, Clone)]
pub struct ValueCodec {
    threshold: usize,
}

impl Default for ValueCodec {
    fn default() -> Self {
        ValueCodec {
            threshold: COMPRESS_THRESHOLD,
        }
    }
}

impl ValueCodec {
    #[cfg(test)]
    fn with_threshold(threshold: usize) -> Self {
        ValueCodec { threshold }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let raw = serde_json::to_vec(value).map_err(CodecError::Serialize)?;
        if raw.len() <= self.threshold {
            return Ok(raw);
        }
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(COMPRESS_FLAG.len() + raw.len() / 2),
            Compression::default(),
        );
        encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish())
            .map(|packed| {
                let mut out = Vec::with_capacity(COMPRESS_FLAG.len() + packed.len());
                out.extend_from_slice(COMPRESS_FLAG);
                out.extend_from_slice(&packed);
                out
            })
            .map_err(|e| CodecError::Corrupt(format!("compression failed: {e}")))
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        if let Some(packed) = data.strip_prefix(COMPRESS_FLAG) {
            let mut raw = Vec::with_capacity(packed.len() * 2);
            ZlibDecoder::new(packed)
                .read_to_end(&mut raw)
                .map_err(|e| CodecError::Corrupt(format!("decompression failed: {e}")))?;
            serde_json::from_slice(&raw).map_err(|e| CodecError::Corrupt(e.to_string()))
        } else {
            serde_json::from_slice(data).map_err(|e| CodecError::Corrupt(e.to_string()))
        }
    }
}
