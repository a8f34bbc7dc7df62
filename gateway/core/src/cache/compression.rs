//! L3 Payload Compression
//!
//! L3 values carry a one-byte header so readers know how to decode them:
//!
//! | Header | Body |
//! |--------|------|
//! | `0x00` | raw bytes |
//! | `0x01` | gzip stream |
//!
//! A payload is compressed only when it exceeds the configured threshold
//! and the compressed form is actually smaller.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::StoreError;

const HEADER_RAW: u8 = 0x00;
const HEADER_GZIP: u8 = 0x01;

/// An encoded L3 payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packed {
    /// Header byte followed by the body
    pub bytes: Vec<u8>,
    /// Bytes saved relative to storing the raw value (0 when stored raw)
    pub saved: u64,
}

impl Packed {
    /// Whether the body is compressed
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.bytes.first() == Some(&HEADER_GZIP)
    }
}

/// Threshold-gated gzip compressor
#[derive(Clone, Copy, Debug)]
pub struct Compressor {
    enabled: bool,
    threshold: usize,
    level: u32,
}

impl Compressor {
    /// Create a compressor
    #[must_use]
    pub fn new(enabled: bool, threshold: usize, level: u32) -> Self {
        Self {
            enabled,
            threshold,
            level: level.min(9),
        }
    }

    /// Encode a value for L3
    #[must_use]
    pub fn pack(&self, value: &[u8]) -> Packed {
        if self.enabled && value.len() > self.threshold {
            match self.gzip(value) {
                Ok(body) if body.len() < value.len() => {
                    let saved = (value.len() - body.len()) as u64;
                    let mut bytes = Vec::with_capacity(body.len() + 1);
                    bytes.push(HEADER_GZIP);
                    bytes.extend_from_slice(&body);
                    return Packed { bytes, saved };
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Compression failed, storing raw"),
            }
        }

        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.push(HEADER_RAW);
        bytes.extend_from_slice(value);
        Packed { bytes, saved: 0 }
    }

    fn gzip(&self, value: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(value)?;
        encoder.finish()
    }
}

/// Decode an L3 payload
///
/// # Errors
///
/// Returns `StoreError::Codec` for an empty payload, an unknown header or a
/// corrupt gzip stream.
pub fn unpack(packed: &[u8]) -> Result<Vec<u8>, StoreError> {
    match packed.split_first() {
        Some((&HEADER_RAW, body)) => Ok(body.to_vec()),
        Some((&HEADER_GZIP, body)) => {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Some((header, _)) => Err(StoreError::Codec(format!(
            "unknown L3 header byte {header:#04x}"
        ))),
        None => Err(StoreError::Codec("empty L3 payload".to_string())),
    }
}
