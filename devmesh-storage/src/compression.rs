//! Gzip compression for cache payloads above a size threshold.
//!
//! Compressed bytes are framed with the standard gzip magic header (`0x1f
//! 0x8b`) so a reader can tell compressed payloads apart from raw ones
//! without a side-channel flag: `is_compressed` just checks the first two
//! bytes.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("failed to compress payload: {0}")]
    CompressFailed(String),
    #[error("failed to decompress payload: {0}")]
    DecompressFailed(String),
}

pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 2 && data[0..2] == GZIP_MAGIC
}

/// Compresses `data` if it is at least `min_size_bytes` long, returning it
/// unchanged otherwise. Output is only ever gzip-framed or a verbatim copy of
/// the input, never ambiguous: callers branch on [`is_compressed`] to decide
/// whether to run [`decompress`].
pub fn compress_if_worthwhile(data: &[u8], min_size_bytes: usize) -> Result<Vec<u8>, CompressionError> {
    if data.len() < min_size_bytes {
        return Ok(data.to_vec());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_left_uncompressed() {
        let data = b"short";
        let out = compress_if_worthwhile(data, 1024).unwrap();
        assert_eq!(out, data);
        assert!(!is_compressed(&out));
    }

    #[test]
    fn large_payload_is_gzip_framed() {
        let data = vec![b'a'; 2048];
        let out = compress_if_worthwhile(&data, 1024).unwrap();
        assert!(is_compressed(&out));
        assert!(out.len() < data.len());
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let data = vec![b'x'; 4096];
        let compressed = compress_if_worthwhile(&data, 1024).unwrap();
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn decompress_is_identity_for_uncompressed_input() {
        let data = b"plain bytes, no gzip header";
        assert_eq!(decompress(data).unwrap(), data);
    }
}
