//! zstd compression of checkpoint payloads.

use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::errors::CheckpointError;

/// zstd level used for checkpoint payloads.
const ZSTD_COMPRESSION_LEVEL: i32 = 1;

/// Metrics about a compression operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetrics {
    /// Original size in bytes.
    pub original_bytes: usize,
    /// Compressed size in bytes.
    pub compressed_bytes: usize,
    /// Reduction in bytes.
    pub reduction_bytes: usize,
    /// Compression ratio (compressed/original).
    pub ratio: f64,
}

impl CompressionMetrics {
    /// Creates new metrics.
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let reduction_bytes = original_bytes.saturating_sub(compressed_bytes);
        let ratio = if original_bytes == 0 {
            1.0
        } else {
            compressed_bytes as f64 / original_bytes as f64
        };

        Self {
            original_bytes,
            compressed_bytes,
            reduction_bytes,
            ratio,
        }
    }
}

/// Compresses bytes with zstd.
///
/// # Errors
///
/// Returns an error if compression fails.
pub fn compress(data: &[u8]) -> Result<(Vec<u8>, CompressionMetrics), CheckpointError> {
    let compressed = zstd::bulk::compress(data, ZSTD_COMPRESSION_LEVEL)
        .map_err(|e| CheckpointError::Compression(e.to_string()))?;
    let metrics = CompressionMetrics::new(data.len(), compressed.len());
    Ok((compressed, metrics))
}

/// Decompresses zstd bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid zstd frame.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CheckpointError> {
    zstd::decode_all(Cursor::new(data)).map_err(|e| CheckpointError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let data = b"hello world repeated hello world repeated hello world repeated";
        let (compressed, _) = compress(data).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), data.to_vec());
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let data = "P12345,HMDB0000001,0.95\n".repeat(500);
        let (compressed, metrics) = compress(data.as_bytes()).unwrap();
        assert!(compressed.len() < data.len() / 4);
        assert_eq!(metrics.original_bytes, data.len());
        assert!(metrics.ratio < 0.25);
    }

    #[test]
    fn test_metrics_empty() {
        let metrics = CompressionMetrics::new(0, 0);
        assert!((metrics.ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decompress(b"not zstd"),
            Err(CheckpointError::Compression(_))
        ));
    }
}
