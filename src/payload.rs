//! The compressed payload served to clients and its packet fragmentation.

use crate::compress::Compressor;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Immutable compressed bytes produced once at startup.
#[derive(Debug, Clone)]
pub struct Payload {
    bytes: Bytes,
}

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Read `path` and compress it with `compressor`.
    pub fn load(path: &Path, compressor: &dyn Compressor) -> Result<Self, PayloadError> {
        let raw = std::fs::read(path).map_err(|e| PayloadError::Read(path.to_path_buf(), e))?;
        let compressed = compressor
            .compress(&raw)
            .map_err(|e| PayloadError::Compress(path.to_path_buf(), e))?;

        info!(
            input = %path.display(),
            raw_size = raw.len(),
            compressed_size = compressed.len(),
            "Payload prepared"
        );

        Ok(Self::new(compressed))
    }

    #[cfg(test)]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Size every session is measured against.
    pub fn expected_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Split into packets of at most `max_len` bytes, in order.
    pub fn packets(&self, max_len: usize) -> Vec<Bytes> {
        split_into_packets(&self.bytes, max_len)
    }
}

/// Split `data` sequentially from offset 0 into chunks of at most `max_len`.
///
/// Only the last chunk may be shorter, and no empty chunk is ever produced.
/// Chunks share `data`'s allocation.
///
/// # Panics
/// Panics if `max_len` is zero.
pub fn split_into_packets(data: &Bytes, max_len: usize) -> Vec<Bytes> {
    assert!(max_len > 0, "packet size must be non-zero");

    let mut packets = Vec::with_capacity(data.len().div_ceil(max_len));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + max_len).min(data.len());
        packets.push(data.slice(offset..end));
        offset = end;
    }
    packets
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to read payload source '{}': {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to compress '{}': {}", .0.display(), .1)]
    Compress(PathBuf, #[source] std::io::Error),
}
