//! Savestate compression.
//!
//! Snapshots cross the wire compressed; the inflated size always travels
//! alongside, so the backend contract is a pair of whole-buffer calls
//! rather than a streaming interface. The default backend is zstd; swap in
//! anything else via [`CompressionBackend`].

use std::fmt;

/// Errors from a compression backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompressionError {
    /// The backend itself failed. The message is whatever the backend
    /// reported; backends expose no structured causes.
    Backend {
        /// Backend-reported failure text.
        message: String,
    },
    /// Decompression did not produce the advertised number of bytes.
    OutputMismatch {
        /// Bytes the wire header promised.
        expected: usize,
        /// Bytes the backend produced.
        actual: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message } => write!(f, "compression backend failed: {message}"),
            Self::OutputMismatch { expected, actual } => write!(
                f,
                "decompressed {actual} bytes where {expected} were promised"
            ),
        }
    }
}

impl std::error::Error for CompressionError {}

/// A whole-buffer compression codec for savestate transfer.
pub trait CompressionBackend: Send {
    /// Compresses `input`, replacing the contents of `output`.
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CompressionError>;

    /// Decompresses `input` into exactly `output.len()` bytes.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CompressionError>;
}

/// Identity backend: stores snapshots uncompressed.
///
/// The fallback when the `zstd` feature is disabled, and a useful pair of
/// eyes in tests since the wire bytes stay readable.
#[derive(Debug, Default)]
pub struct NullBackend;

impl CompressionBackend for NullBackend {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CompressionError> {
        output.clear();
        output.extend_from_slice(input);
        Ok(())
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CompressionError> {
        if input.len() != output.len() {
            return Err(CompressionError::OutputMismatch {
                expected: output.len(),
                actual: input.len(),
            });
        }
        output.copy_from_slice(input);
        Ok(())
    }
}

/// Zstandard-backed codec.
#[cfg(feature = "zstd")]
pub struct ZstdBackend {
    compressor: zstd::bulk::Compressor<'static>,
    decompressor: zstd::bulk::Decompressor<'static>,
}

#[cfg(feature = "zstd")]
impl ZstdBackend {
    /// Creates a backend at the given compression level (0 picks the zstd
    /// default).
    pub fn new(level: i32) -> Result<Self, CompressionError> {
        Ok(Self {
            compressor: zstd::bulk::Compressor::new(level).map_err(|e| {
                CompressionError::Backend {
                    message: e.to_string(),
                }
            })?,
            decompressor: zstd::bulk::Decompressor::new().map_err(|e| {
                CompressionError::Backend {
                    message: e.to_string(),
                }
            })?,
        })
    }
}

#[cfg(feature = "zstd")]
impl CompressionBackend for ZstdBackend {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CompressionError> {
        let compressed = self
            .compressor
            .compress(input)
            .map_err(|e| CompressionError::Backend {
                message: e.to_string(),
            })?;
        *output = compressed;
        Ok(())
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CompressionError> {
        let written = self
            .decompressor
            .decompress_to_buffer(input, output)
            .map_err(|e| CompressionError::Backend {
                message: e.to_string(),
            })?;
        if written != output.len() {
            return Err(CompressionError::OutputMismatch {
                expected: output.len(),
                actual: written,
            });
        }
        Ok(())
    }
}

/// The backend sessions use unless the builder overrides it.
pub(crate) fn default_backend() -> Box<dyn CompressionBackend> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(backend) = ZstdBackend::new(0) {
            return Box::new(backend);
        }
    }
    Box::new(NullBackend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(backend: &mut dyn CompressionBackend) {
        let snapshot: Vec<u8> = (0..512u32).flat_map(|v| (v % 7).to_be_bytes()).collect();
        let mut packed = Vec::new();
        backend.compress(&snapshot, &mut packed).expect("compress");

        let mut restored = vec![0u8; snapshot.len()];
        backend.decompress(&packed, &mut restored).expect("decompress");
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn null_backend_roundtrip() {
        roundtrip(&mut NullBackend);
    }

    #[test]
    fn null_backend_size_mismatch() {
        let mut out = [0u8; 4];
        let err = NullBackend.decompress(&[1, 2], &mut out).expect_err("mismatch");
        assert!(matches!(err, CompressionError::OutputMismatch { expected: 4, actual: 2 }));
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_backend_roundtrip() {
        let mut backend = ZstdBackend::new(0).expect("backend");
        roundtrip(&mut backend);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_shrinks_repetitive_state() {
        let mut backend = ZstdBackend::new(0).expect("backend");
        let snapshot = vec![0u8; 8192];
        let mut packed = Vec::new();
        backend.compress(&snapshot, &mut packed).expect("compress");
        assert!(packed.len() < snapshot.len());
    }
}
