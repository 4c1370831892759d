//! Payload compression
//!
//! Gzip compression of JSON payloads, gated by a size threshold so small
//! payloads are sent as-is. Compression is lossless; failures surface as
//! [`CompressionError`] and callers fall back to the uncompressed body.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default size, in bytes, below which payloads are not compressed
pub const DEFAULT_THRESHOLD_BYTES: usize = 1024;

/// Default gzip level
pub const DEFAULT_LEVEL: u32 = 6;

/// Rolling stats window: once it exceeds `STATS_CAPACITY`, it is trimmed to
/// the newest `STATS_RETAIN` entries
const STATS_CAPACITY: usize = 100;
const STATS_RETAIN: usize = 50;

/// Errors that can occur while compressing or decompressing
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Gzip encoding failed: {0}")]
    Encode(#[source] std::io::Error),

    #[error("Gzip decoding failed: {0}")]
    Decode(#[source] std::io::Error),

    #[error("Decompressed payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    pub enabled: bool,
    /// Gzip level, 0-9
    pub level: u32,
    /// Minimum serialized size to compress
    pub threshold_bytes: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            level: DEFAULT_LEVEL,
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
        }
    }
}

/// Measurements for one compression or decompression
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    /// Fraction of bytes saved, `1 - compressed / original`
    pub ratio: f64,
    pub duration: Duration,
}

impl CompressionStats {
    fn new(original_size: usize, compressed_size: usize, duration: Duration) -> Self {
        let ratio = if original_size == 0 {
            0.0
        } else {
            1.0 - compressed_size as f64 / original_size as f64
        };
        Self {
            original_size,
            compressed_size,
            ratio,
            duration,
        }
    }

    pub fn bytes_saved(&self) -> i64 {
        self.original_size as i64 - self.compressed_size as i64
    }
}

/// A compressed payload
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub bytes: Vec<u8>,
    pub stats: CompressionStats,
}

impl CompressedPayload {
    /// Encode the compressed bytes for embedding in JSON
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }
}

/// A decompressed payload
#[derive(Debug, Clone)]
pub struct DecompressedPayload {
    pub data: Value,
    pub stats: CompressionStats,
}

/// Aggregate over the rolling stats window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSummary {
    pub total_compressions: usize,
    pub average_ratio: f64,
    pub average_duration_ms: f64,
    pub total_bytes_saved: i64,
}

/// Threshold-gated gzip compressor
#[derive(Debug)]
pub struct PayloadCompressor {
    options: CompressionOptions,
    history: Mutex<VecDeque<CompressionStats>>,
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self::new(CompressionOptions::default())
    }
}

impl PayloadCompressor {
    pub fn new(options: CompressionOptions) -> Self {
        Self {
            options,
            history: Mutex::new(VecDeque::with_capacity(STATS_CAPACITY + 1)),
        }
    }

    pub fn options(&self) -> &CompressionOptions {
        &self.options
    }

    /// Whether `data` is large enough to be worth compressing
    pub fn should_compress(&self, data: &Value) -> bool {
        match serde_json::to_vec(data) {
            Ok(bytes) => self.should_compress_len(bytes.len()),
            Err(_) => false,
        }
    }

    /// Threshold check on an already-serialized length
    pub fn should_compress_len(&self, len: usize) -> bool {
        self.options.enabled && len >= self.options.threshold_bytes
    }

    /// Compress a JSON value
    ///
    /// Returns `Ok(None)` when compression is disabled or the payload is below
    /// the threshold.
    pub fn compress(&self, data: &Value) -> Result<Option<CompressedPayload>, CompressionError> {
        let bytes = serde_json::to_vec(data).map_err(CompressionError::Serialize)?;
        self.compress_bytes(&bytes)
    }

    /// Compress an already-serialized JSON body
    pub fn compress_bytes(&self, bytes: &[u8]) -> Result<Option<CompressedPayload>, CompressionError> {
        if !self.should_compress_len(bytes.len()) {
            return Ok(None);
        }

        let started = Instant::now();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.options.level.min(9)));
        encoder.write_all(bytes).map_err(CompressionError::Encode)?;
        let compressed = encoder.finish().map_err(CompressionError::Encode)?;

        let stats = CompressionStats::new(bytes.len(), compressed.len(), started.elapsed());
        debug!(
            "Compressed {} -> {} bytes ({:.1}% saved)",
            stats.original_size,
            stats.compressed_size,
            stats.ratio * 100.0
        );
        self.record(stats);

        Ok(Some(CompressedPayload {
            bytes: compressed,
            stats,
        }))
    }

    /// Decompress gzip bytes back into JSON
    pub fn decompress(&self, bytes: &[u8]) -> Result<DecompressedPayload, CompressionError> {
        let started = Instant::now();
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(CompressionError::Decode)?;
        let data = serde_json::from_slice(&raw).map_err(CompressionError::InvalidJson)?;

        Ok(DecompressedPayload {
            data,
            stats: CompressionStats::new(raw.len(), bytes.len(), started.elapsed()),
        })
    }

    /// Compress and base64-encode, `Ok(None)` below threshold
    pub fn compress_to_base64(&self, data: &Value) -> Result<Option<String>, CompressionError> {
        Ok(self.compress(data)?.map(|payload| payload.to_base64()))
    }

    /// Decode base64 and decompress
    pub fn decompress_from_base64(&self, encoded: &str) -> Result<DecompressedPayload, CompressionError> {
        let bytes = BASE64.decode(encoded)?;
        self.decompress(&bytes)
    }

    /// Aggregate stats over the rolling window
    pub fn summary(&self) -> CompressionSummary {
        let history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        if history.is_empty() {
            return CompressionSummary::default();
        }

        let n = history.len() as f64;
        CompressionSummary {
            total_compressions: history.len(),
            average_ratio: history.iter().map(|s| s.ratio).sum::<f64>() / n,
            average_duration_ms: history
                .iter()
                .map(|s| s.duration.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / n,
            total_bytes_saved: history.iter().map(CompressionStats::bytes_saved).sum(),
        }
    }

    /// Drop all recorded stats
    pub fn reset_stats(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    fn record(&self, stats: CompressionStats) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        history.push_back(stats);
        if history.len() > STATS_CAPACITY {
            let excess = history.len() - STATS_RETAIN;
            history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn large_payload() -> Value {
        let items: Vec<Value> = (0..100)
            .map(|i| {
                json!({
                    "localId": format!("op-{i}"),
                    "entityType": "product",
                    "entityData": {"name": "Savon de Marseille", "price": 12.5, "stock": i},
                })
            })
            .collect();
        json!({ "deviceId": "device-1", "operations": items })
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let compressor = PayloadCompressor::default();
        let data = large_payload();

        let compressed = compressor.compress(&data).unwrap().expect("above threshold");
        assert!(compressed.stats.compressed_size < compressed.stats.original_size);
        assert!(compressed.stats.ratio > 0.0);

        let restored = compressor.decompress(&compressed.bytes).unwrap();
        assert_eq!(restored.data, data);
        assert_eq!(restored.stats.original_size, compressed.stats.original_size);
    }

    #[test]
    fn test_round_trip_unusual_json() {
        let compressor = PayloadCompressor::new(CompressionOptions {
            threshold_bytes: 0,
            ..Default::default()
        });
        let data = json!({
            "unicode": "café ☕ 日本語",
            "nested": [[], {}, [null, true, false]],
            "numbers": [0, -1, 1.5, i64::MAX],
            "empty": "",
        });

        let compressed = compressor.compress(&data).unwrap().unwrap();
        assert_eq!(compressor.decompress(&compressed.bytes).unwrap().data, data);
    }

    #[test]
    fn test_below_threshold_returns_none() {
        let compressor = PayloadCompressor::default();
        let data = json!({"name": "tiny"});
        let before = data.clone();

        assert!(!compressor.should_compress(&data));
        assert!(compressor.compress(&data).unwrap().is_none());
        assert_eq!(data, before);
        assert_eq!(compressor.summary().total_compressions, 0);
    }

    #[test]
    fn test_disabled_never_compresses() {
        let compressor = PayloadCompressor::new(CompressionOptions {
            enabled: false,
            ..Default::default()
        });
        assert!(!compressor.should_compress(&large_payload()));
        assert!(compressor.compress(&large_payload()).unwrap().is_none());
    }

    #[test]
    fn test_decompress_garbage_is_typed_error() {
        let compressor = PayloadCompressor::default();
        let result = compressor.decompress(b"definitely not gzip");
        assert!(matches!(result, Err(CompressionError::Decode(_))));
    }

    #[test]
    fn test_base64_helpers() {
        let compressor = PayloadCompressor::default();
        let data = large_payload();

        let encoded = compressor.compress_to_base64(&data).unwrap().unwrap();
        let restored = compressor.decompress_from_base64(&encoded).unwrap();
        assert_eq!(restored.data, data);

        assert!(matches!(
            compressor.decompress_from_base64("***"),
            Err(CompressionError::Base64(_))
        ));
    }

    #[test]
    fn test_stats_window_is_trimmed() {
        let compressor = PayloadCompressor::new(CompressionOptions {
            threshold_bytes: 0,
            ..Default::default()
        });
        for i in 0..=STATS_CAPACITY {
            compressor.compress(&json!({ "i": i })).unwrap();
        }
        assert_eq!(compressor.summary().total_compressions, STATS_RETAIN);

        compressor.reset_stats();
        assert_eq!(compressor.summary(), CompressionSummary::default());
    }
}
