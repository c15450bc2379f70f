//! # Payload Codec
//!
//! Turns response payloads into storable strings and back. Payloads are
//! serialized to JSON; when the JSON reaches the compression threshold it is
//! gzipped and base64-encoded so it still travels as text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use crate::core::error::{CacheError, CacheResult};

/// Default compression threshold in bytes
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Output of [`PayloadCodec::encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub data: String,
    pub compressed: bool,
}

impl EncodedPayload {
    /// Size of the stored representation
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    threshold: usize,
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl PayloadCodec {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Serialize a value, compressing it when it is at least `threshold` bytes
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<EncodedPayload> {
        self.encode_with(value, true)
    }

    /// Serialize a value; `allow_compression = false` always stores plain JSON
    pub fn encode_with<T: Serialize + ?Sized>(
        &self,
        value: &T,
        allow_compression: bool,
    ) -> CacheResult<EncodedPayload> {
        let json = serde_json::to_string(value)?;

        if !allow_compression || json.len() < self.threshold {
            return Ok(EncodedPayload {
                data: json,
                compressed: false,
            });
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(json.as_bytes())
            .map_err(CacheError::Compression)?;
        let gzipped = encoder.finish().map_err(CacheError::Compression)?;

        Ok(EncodedPayload {
            data: BASE64.encode(gzipped),
            compressed: true,
        })
    }

    /// Exact inverse of [`encode`](Self::encode)
    pub fn decode<T: DeserializeOwned>(&self, data: &str, compressed: bool) -> CacheResult<T> {
        if !compressed {
            return Ok(serde_json::from_str(data)?);
        }

        let gzipped = BASE64.decode(data)?;
        let mut json = String::new();
        GzDecoder::new(gzipped.as_slice())
            .read_to_string(&mut json)
            .map_err(CacheError::Compression)?;

        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Analysis {
        summary: String,
        tags: Vec<String>,
        score: f64,
    }

    fn analysis_of_size(approx_bytes: usize) -> Analysis {
        Analysis {
            summary: "x".repeat(approx_bytes),
            tags: vec!["rust".to_string(), "cache".to_string()],
            score: 0.75,
        }
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let codec = PayloadCodec::default();
        let value = analysis_of_size(1000);

        let encoded = codec.encode(&value).unwrap();
        assert!(!encoded.compressed);
        assert!(encoded.data.starts_with('{'));

        let decoded: Analysis = codec.decode(&encoded.data, encoded.compressed).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let codec = PayloadCodec::default();
        let value = analysis_of_size(2000);

        let encoded = codec.encode(&value).unwrap();
        assert!(encoded.compressed);
        assert!(encoded.len() < 2000);

        let decoded: Analysis = codec.decode(&encoded.data, encoded.compressed).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_compression_can_be_disabled() {
        let codec = PayloadCodec::default();
        let encoded = codec.encode_with(&analysis_of_size(5000), false).unwrap();
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_threshold_boundary() {
        let codec = PayloadCodec::new(8);
        // "\"abcdef\"" is exactly 8 bytes of JSON
        assert!(codec.encode("abcdef").unwrap().compressed);
        assert!(!codec.encode("abcde").unwrap().compressed);
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let codec = PayloadCodec::default();

        let not_base64: CacheResult<Analysis> = codec.decode("%%%not base64%%%", true);
        assert!(matches!(not_base64, Err(CacheError::Encoding(_))));

        let not_gzip: CacheResult<Analysis> = codec.decode(&BASE64.encode(b"plain bytes"), true);
        assert!(matches!(not_gzip, Err(CacheError::Compression(_))));

        let wrong_shape: CacheResult<Analysis> = codec.decode("[1, 2, 3]", false);
        assert!(matches!(wrong_shape, Err(CacheError::Serialization(_))));
    }
}
