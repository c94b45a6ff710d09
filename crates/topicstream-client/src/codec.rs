//! Payload compression.
//!
//! Every message payload is compressed on its own with the codec of its
//! batch. `Raw`, `Gzip`, `Lz4` and `Zstd` are implemented here. Custom codec
//! ids are understood on the wire but cannot be encoded or decoded.
//!
//! Decoding never produces more bytes than the message's declared
//! uncompressed size, or [`MAX_DECODED_SIZE`] when the size is unknown.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use topicstream_proto::{Codec as WireCodec, CODEC_CUSTOM_START};

use crate::error::{ClientError, Result};

/// Output limit for payloads that do not declare their uncompressed size.
pub const MAX_DECODED_SIZE: usize = 64 * 1024 * 1024;

/// Largest expansion the LZ4 block format can produce per input byte.
const LZ4_MAX_RATIO: usize = 255;

const ZSTD_LEVEL: i32 = 3;

/// Compression codec of a message batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// No compression
    #[default]
    Raw,
    Gzip,
    /// LZ4 block format with a little-endian size prefix
    Lz4,
    Zstd,
    /// A user-defined codec id (10000 and above)
    Custom(i32),
}

impl Codec {
    /// Wire id of this codec.
    pub fn to_wire(self) -> i32 {
        match self {
            Codec::Raw => WireCodec::Raw as i32,
            Codec::Gzip => WireCodec::Gzip as i32,
            Codec::Lz4 => WireCodec::Lz4 as i32,
            Codec::Zstd => WireCodec::Zstd as i32,
            Codec::Custom(id) => id,
        }
    }

    /// Codec of a wire id. An unspecified id means raw.
    pub fn from_wire(value: i32) -> Self {
        match WireCodec::try_from(value) {
            Ok(WireCodec::Unspecified) | Ok(WireCodec::Raw) => Codec::Raw,
            Ok(WireCodec::Gzip) => Codec::Gzip,
            Ok(WireCodec::Lz4) => Codec::Lz4,
            Ok(WireCodec::Zstd) => Codec::Zstd,
            Err(_) => Codec::Custom(value),
        }
    }

    pub fn is_custom(self) -> bool {
        matches!(self, Codec::Custom(id) if id >= CODEC_CUSTOM_START)
    }

    /// Whether this client can encode and decode the codec.
    pub fn is_supported_locally(self) -> bool {
        !matches!(self, Codec::Custom(_))
    }

    /// Compress one payload.
    pub fn encode(self, data: &[u8]) -> Result<Bytes> {
        match self {
            Codec::Raw => Ok(Bytes::copy_from_slice(data)),
            Codec::Gzip => gzip(data)
                .map(Bytes::from)
                .map_err(|e| ClientError::Codec(format!("gzip compression failed: {}", e))),
            Codec::Lz4 => lz4::block::compress(
                data,
                Some(lz4::block::CompressionMode::DEFAULT),
                true,
            )
            .map(Bytes::from)
            .map_err(|e| ClientError::Codec(format!("lz4 compression failed: {}", e))),
            Codec::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
                .map(Bytes::from)
                .map_err(|e| ClientError::Codec(format!("zstd compression failed: {}", e))),
            Codec::Custom(_) => Err(ClientError::UnsupportedCodec {
                codec: self,
                supported: Self::local(),
            }),
        }
    }

    /// Decompress one payload.
    ///
    /// `uncompressed_size` is the size the producer declared for the
    /// message; zero or negative means unknown. A compressed payload that
    /// decodes to a different size fails with [`ClientError::Codec`].
    pub fn decode(self, data: &[u8], uncompressed_size: i64) -> Result<Bytes> {
        let expected = usize::try_from(uncompressed_size).ok().filter(|size| *size > 0);
        match self {
            Codec::Raw => Ok(Bytes::copy_from_slice(data)),
            Codec::Gzip => {
                let decoded = read_bounded(GzDecoder::new(data), expected)
                    .map_err(|e| ClientError::Codec(format!("gzip decompression failed: {}", e)))?;
                check_size(self, decoded, expected)
            }
            Codec::Lz4 => {
                let size = lz4_size_prefix(data)?;
                if let Some(expected) = expected {
                    if size != expected {
                        return Err(size_mismatch(self, size, expected));
                    }
                }
                let limit = expected.unwrap_or(MAX_DECODED_SIZE);
                if size > limit || size > data.len().saturating_mul(LZ4_MAX_RATIO) {
                    return Err(ClientError::Codec(format!(
                        "lz4 size prefix {} exceeds the limit for a {} byte payload",
                        size,
                        data.len()
                    )));
                }
                lz4::block::decompress(data, None)
                    .map(Bytes::from)
                    .map_err(|e| ClientError::Codec(format!("lz4 decompression failed: {}", e)))
            }
            Codec::Zstd => {
                let decoded = zstd::stream::read::Decoder::new(data)
                    .and_then(|decoder| read_bounded(decoder, expected))
                    .map_err(|e| ClientError::Codec(format!("zstd decompression failed: {}", e)))?;
                check_size(self, decoded, expected)
            }
            Codec::Custom(_) => Err(ClientError::UnsupportedCodec {
                codec: self,
                supported: Self::local(),
            }),
        }
    }

    /// Codecs this client implements.
    pub fn local() -> Vec<Codec> {
        vec![Codec::Raw, Codec::Gzip, Codec::Lz4, Codec::Zstd]
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Read at most one byte past the limit so an oversized payload is
/// detected without being buffered.
fn read_bounded(reader: impl Read, expected: Option<usize>) -> std::io::Result<Vec<u8>> {
    let limit = expected.unwrap_or(MAX_DECODED_SIZE);
    let mut decoded = Vec::with_capacity(expected.unwrap_or(0));
    reader.take(limit as u64 + 1).read_to_end(&mut decoded)?;
    Ok(decoded)
}

fn check_size(codec: Codec, decoded: Vec<u8>, expected: Option<usize>) -> Result<Bytes> {
    match expected {
        Some(expected) if decoded.len() != expected => {
            Err(size_mismatch(codec, decoded.len(), expected))
        }
        None if decoded.len() > MAX_DECODED_SIZE => Err(ClientError::Codec(format!(
            "{} payload decodes to more than {} bytes",
            codec, MAX_DECODED_SIZE
        ))),
        _ => Ok(Bytes::from(decoded)),
    }
}

fn size_mismatch(codec: Codec, actual: usize, expected: usize) -> ClientError {
    ClientError::Codec(format!(
        "{} payload decodes to {} bytes, expected {}",
        codec, actual, expected
    ))
}

fn lz4_size_prefix(data: &[u8]) -> Result<usize> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| ClientError::Codec("lz4 payload is missing its size prefix".to_string()))?;
    let size = i32::from_le_bytes(prefix);
    usize::try_from(size)
        .map_err(|_| ClientError::Codec(format!("lz4 size prefix {} is negative", size)))
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Raw => write!(f, "raw"),
            Codec::Gzip => write!(f, "gzip"),
            Codec::Lz4 => write!(f, "lz4"),
            Codec::Zstd => write!(f, "zstd"),
            Codec::Custom(id) => write!(f, "custom({})", id),
        }
    }
}
