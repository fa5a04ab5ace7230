//! Snapshot blob compression.
//!
//! The codec is resolved once when the [`SnapshotManager`](super::SnapshotManager)
//! is built. `zstd` is preferred and requires the `zstd` cargo feature; without
//! it the manager falls back to `gzip`, which is always available. Blobs record
//! the codec they were written with, so `load` never guesses.

use super::SnapshotError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::warn;

/// Compression applied to serialized parameters before they hit disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    None,
    Gzip,
    #[default]
    Zstd,
}

#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

impl Codec {
    /// Whether this build can read and write zstd blobs.
    pub const fn zstd_available() -> bool {
        cfg!(feature = "zstd")
    }

    /// Pick the codec actually used for writing.
    pub fn resolve(preferred: Codec) -> Codec {
        match preferred {
            Codec::Zstd if !Self::zstd_available() => {
                warn!("zstd support not compiled in, falling back to gzip for snapshots");
                Codec::Gzip
            }
            other => other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "none" => Some(Codec::None),
            "gzip" => Some(Codec::Gzip),
            "zstd" => Some(Codec::Zstd),
            _ => None,
        }
    }

    /// File extension for blobs written with this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::None => "bin",
            Codec::Gzip => "gz",
            Codec::Zstd => "zst",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| self.error(e))
            }
            Codec::Zstd => self.zstd_compress(data),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| self.error(e))?;
                Ok(out)
            }
            Codec::Zstd => self.zstd_decompress(data),
        }
    }

    #[cfg(feature = "zstd")]
    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
        zstd::encode_all(data, ZSTD_LEVEL).map_err(|e| self.error(e))
    }

    #[cfg(not(feature = "zstd"))]
    fn zstd_compress(&self, _data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
        Err(self.error("zstd support not compiled in"))
    }

    #[cfg(feature = "zstd")]
    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
        zstd::decode_all(data).map_err(|e| self.error(e))
    }

    #[cfg(not(feature = "zstd"))]
    fn zstd_decompress(&self, _data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
        Err(self.error("zstd support not compiled in"))
    }

    fn error(&self, message: impl std::fmt::Display) -> SnapshotError {
        SnapshotError::Codec {
            codec: self.name(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
