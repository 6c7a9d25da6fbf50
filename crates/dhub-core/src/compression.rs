//! Batch Payload Compression
//!
//! The batch codec compresses the concatenated Avro payload with one of four
//! codecs. The codec id lives in the low two bits of the frame's attribute
//! field, so the ids below are part of the wire format.
//!
//! ## Codecs
//! - **None** (0): payload stored as-is
//! - **Deflate** (1): zlib-framed DEFLATE (self-framing)
//! - **Lz4** (2): raw LZ4 block with no size prefix; the raw-size hint from the
//!   frame header is required to decompress
//! - **Zstd** (3): standard zstd frame
//!
//! This is the batch codec only. HTTP request-body compression is a transport
//! concern and configured separately.

use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

const ZSTD_LEVEL: i32 = 3;

// Largest output one stored byte can expand to. LZ4 sequences add at most 255
// bytes per length byte, DEFLATE tops out near 1032:1 and a zstd RLE block
// fills 128 KiB from a four-byte block.
const LZ4_MAX_RATIO: usize = 255;
const DEFLATE_MAX_RATIO: usize = 1032;
const ZSTD_MAX_RATIO: usize = 32_768;
const CODEC_SLACK: usize = 64;

/// Batch payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum CompressType {
    None = 0,
    Deflate = 1,
    #[default]
    Lz4 = 2,
    Zstd = 3,
}

impl CompressType {
    /// Wire id stored in the frame attribute bits.
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressType::None => "none",
            CompressType::Deflate => "deflate",
            CompressType::Lz4 => "lz4",
            CompressType::Zstd => "zstd",
        }
    }

    /// Upper bound on the uncompressed size `stored` bytes can decode to.
    pub fn max_raw_size(self, stored: usize) -> usize {
        let ratio = match self {
            CompressType::None => return stored,
            CompressType::Deflate => DEFLATE_MAX_RATIO,
            CompressType::Lz4 => LZ4_MAX_RATIO,
            CompressType::Zstd => ZSTD_MAX_RATIO,
        };
        stored.saturating_mul(ratio).saturating_add(CODEC_SLACK)
    }

    /// Codec implementation for this type.
    pub fn compressor(self) -> &'static dyn Compressor {
        match self {
            CompressType::None => &NoneCompressor,
            CompressType::Deflate => &DeflateCompressor,
            CompressType::Lz4 => &Lz4Compressor,
            CompressType::Zstd => &ZstdCompressor,
        }
    }
}

impl TryFrom<u16> for CompressType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(CompressType::None),
            1 => Ok(CompressType::Deflate),
            2 => Ok(CompressType::Lz4),
            3 => Ok(CompressType::Zstd),
            _ => Err(Error::InvalidCompression(value.to_string())),
        }
    }
}

impl FromStr for CompressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CompressType::None),
            "deflate" => Ok(CompressType::Deflate),
            "lz4" => Ok(CompressType::Lz4),
            "zstd" => Ok(CompressType::Zstd),
            other => Err(Error::InvalidCompression(other.to_string())),
        }
    }
}

impl fmt::Display for CompressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte-buffer codec.
///
/// `decompress` receives the uncompressed length recorded in the frame header.
/// Implementations must fail with [`Error::Decompression`] rather than return a
/// buffer of a different length.
pub trait Compressor: Send + Sync {
    fn compress_type(&self) -> CompressType;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>>;
}

/// Reject a size hint the input could never decode to, before allocating.
fn check_hint(compress_type: CompressType, data: &[u8], raw_size: usize) -> Result<()> {
    let limit = compress_type.max_raw_size(data.len());
    if raw_size > limit {
        return Err(Error::Decompression(format!(
            "{compress_type} input of {} bytes cannot expand to {raw_size} bytes (limit {limit})",
            data.len()
        )));
    }
    Ok(())
}

fn check_size(out: Vec<u8>, raw_size: usize) -> Result<Vec<u8>> {
    if out.len() != raw_size {
        return Err(Error::Decompression(format!(
            "expected {} bytes, got {}",
            raw_size,
            out.len()
        )));
    }
    Ok(out)
}

pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress_type(&self) -> CompressType {
        CompressType::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>> {
        check_size(data.to_vec(), raw_size)
    }
}

pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress_type(&self) -> CompressType {
        CompressType::Deflate
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| Error::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| Error::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>> {
        check_hint(CompressType::Deflate, data, raw_size)?;
        let mut out = Vec::with_capacity(raw_size);
        // One byte past the hint is enough to detect an oversized stream.
        ZlibDecoder::new(data)
            .take(raw_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::Decompression(e.to_string()))?;
        check_size(out, raw_size)
    }
}

pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress_type(&self) -> CompressType {
        CompressType::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(data))
    }

    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>> {
        check_hint(CompressType::Lz4, data, raw_size)?;
        let out = lz4_flex::block::decompress(data, raw_size)
            .map_err(|e| Error::Decompression(e.to_string()))?;
        check_size(out, raw_size)
    }
}

pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress_type(&self) -> CompressType {
        CompressType::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, ZSTD_LEVEL).map_err(|e| Error::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>> {
        check_hint(CompressType::Zstd, data, raw_size)?;
        let out = zstd::bulk::decompress(data, raw_size)
            .map_err(|e| Error::Decompression(e.to_string()))?;
        check_size(out, raw_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"dhub-record-payload;".repeat(200)
    }

    #[test]
    fn test_every_codec_roundtrips() {
        let data = sample();
        for ct in [
            CompressType::None,
            CompressType::Deflate,
            CompressType::Lz4,
            CompressType::Zstd,
        ] {
            let codec = ct.compressor();
            assert_eq!(codec.compress_type(), ct);
            let packed = codec.compress(&data).unwrap();
            let unpacked = codec.decompress(&packed, data.len()).unwrap();
            assert_eq!(unpacked, data, "codec {ct}");
        }
    }

    #[test]
    fn test_lz4_has_no_size_prefix() {
        let data = sample();
        let packed = CompressType::Lz4.compressor().compress(&data).unwrap();
        assert_eq!(
            lz4_flex::block::decompress(&packed, data.len()).unwrap(),
            data
        );
    }

    #[test]
    fn test_wrong_size_hint_is_an_error() {
        let data = sample();
        let packed = CompressType::Zstd.compressor().compress(&data).unwrap();
        let result = CompressType::Zstd.compressor().decompress(&packed, data.len() + 10);
        assert!(matches!(result, Err(Error::Decompression(_))));

        let result = CompressType::None.compressor().decompress(&data, 3);
        assert!(matches!(result, Err(Error::Decompression(_))));
    }

    #[test]
    fn test_impossible_size_hint_rejected_before_decoding() {
        let packed = CompressType::Lz4.compressor().compress(&sample()).unwrap();
        for ct in [CompressType::Deflate, CompressType::Lz4, CompressType::Zstd] {
            let result = ct.compressor().decompress(&packed, u32::MAX as usize);
            assert!(matches!(result, Err(Error::Decompression(_))), "codec {ct}");
        }
        assert_eq!(CompressType::None.max_raw_size(10), 10);
        assert!(CompressType::Lz4.max_raw_size(10) >= 2550);
    }

    #[test]
    fn test_garbage_fails_to_decompress() {
        let garbage = vec![0xFFu8; 64];
        assert!(CompressType::Deflate
            .compressor()
            .decompress(&garbage, 100)
            .is_err());
    }

    #[test]
    fn test_parse_and_ids() {
        assert_eq!("LZ4".parse::<CompressType>().unwrap(), CompressType::Lz4);
        assert_eq!("deflate".parse::<CompressType>().unwrap(), CompressType::Deflate);
        assert_eq!("".parse::<CompressType>().unwrap(), CompressType::None);
        assert!("snappy".parse::<CompressType>().is_err());

        assert_eq!(CompressType::try_from(3).unwrap(), CompressType::Zstd);
        assert!(CompressType::try_from(4).is_err());
        assert_eq!(CompressType::Deflate.id(), 1);
        assert_eq!(CompressType::default(), CompressType::Lz4);
    }
}
