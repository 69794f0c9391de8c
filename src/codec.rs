//! Tile compression codecs.
//!
//! Each attribute (and the coordinate stream) carries a codec chosen from
//! a small registry: gzip, gzip with a bit-shuffle pre-filter, gzip with
//! a delta pre-filter for monotone integer streams, or none. JPEG2K kinds
//! are recognized for schema compatibility but are out of scope here.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{GridError, GridResult};

/// Compression kinds understood by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    /// No compression.
    None,
    /// Plain gzip.
    Gzip,
    /// Bit-shuffle across fixed-size elements, then gzip.
    BitShuffleGzip,
    /// Per-element delta encoding, then gzip. Suited to offsets and
    /// coordinate streams.
    DeltaGzip,
    /// JPEG2K (recognized, not supported by this crate).
    Jpeg2k,
    /// JPEG2K RGB (recognized, not supported by this crate).
    Jpeg2kRgb,
}

/// A configured compressor/decompressor for one stream.
#[derive(Debug, Clone)]
pub struct Codec {
    kind: CompressionKind,
    level: Compression,
    element_size: usize,
}

impl Codec {
    /// Creates a codec handle. `level` is the gzip level (1-9; anything
    /// else selects the default). `element_size` is the fixed element
    /// width the bit-shuffle and delta filters operate on.
    pub fn create(kind: CompressionKind, level: u32, element_size: usize) -> GridResult<Self> {
        match kind {
            CompressionKind::Jpeg2k | CompressionKind::Jpeg2kRgb => Err(GridError::Codec(
                "JPEG2K codecs are not supported by this build".to_string(),
            )),
            _ => Ok(Self {
                kind,
                level: if (1..=9).contains(&level) {
                    Compression::new(level)
                } else {
                    Compression::default()
                },
                element_size: element_size.max(1),
            }),
        }
    }

    /// A codec for an optional compression kind: `None` for
    /// [`CompressionKind::None`].
    pub fn for_kind(
        kind: CompressionKind,
        level: u32,
        element_size: usize,
    ) -> GridResult<Option<Self>> {
        if kind == CompressionKind::None {
            Ok(None)
        } else {
            Self::create(kind, level, element_size).map(Some)
        }
    }

    /// The configured kind.
    pub fn kind(&self) -> CompressionKind {
        self.kind
    }

    /// Compresses `data`, returning the encoded bytes.
    pub fn compress(&self, data: &[u8]) -> GridResult<Vec<u8>> {
        let filtered;
        let input: &[u8] = match self.kind {
            CompressionKind::None => return Ok(data.to_vec()),
            CompressionKind::Gzip => data,
            CompressionKind::BitShuffleGzip => {
                filtered = bit_shuffle(data, self.element_size)?;
                &filtered
            }
            CompressionKind::DeltaGzip => {
                filtered = delta_encode(data, self.element_size)?;
                &filtered
            }
            CompressionKind::Jpeg2k | CompressionKind::Jpeg2kRgb => {
                return Err(GridError::Codec("JPEG2K is not supported".to_string()));
            }
        };
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(input)
            .and_then(|()| encoder.finish())
            .map_err(|e| GridError::Codec(format!("gzip compression failed: {e}")))
    }

    /// Decompresses `data` into exactly `expected_len` bytes. A length
    /// mismatch or malformed input is an error.
    pub fn decompress(&self, data: &[u8], expected_len: usize) -> GridResult<Vec<u8>> {
        if self.kind == CompressionKind::None {
            if data.len() != expected_len {
                return Err(GridError::Codec(format!(
                    "expected {expected_len} bytes, got {}",
                    data.len()
                )));
            }
            return Ok(data.to_vec());
        }

        let mut decoded = Vec::with_capacity(expected_len);
        let mut decoder = GzDecoder::new(data).take(expected_len as u64 + 1);
        decoder
            .read_to_end(&mut decoded)
            .map_err(|e| GridError::Codec(format!("gzip decompression failed: {e}")))?;
        if decoded.len() != expected_len {
            return Err(GridError::Codec(format!(
                "decompressed length mismatch: expected {expected_len}, got {}",
                decoded.len()
            )));
        }

        match self.kind {
            CompressionKind::BitShuffleGzip => bit_unshuffle(&decoded, self.element_size),
            CompressionKind::DeltaGzip => delta_decode(&decoded, self.element_size),
            _ => Ok(decoded),
        }
    }
}

fn check_element_size(data: &[u8], element_size: usize) -> GridResult<()> {
    if element_size == 0 || data.len() % element_size != 0 {
        return Err(GridError::Codec(format!(
            "stream of {} bytes is not a whole number of {element_size}-byte elements",
            data.len()
        )));
    }
    Ok(())
}

/// Transposes the bit matrix of `n` elements by `element_size * 8` bits:
/// output bit `b * n + i` is bit `b` of element `i`.
fn bit_shuffle(data: &[u8], element_size: usize) -> GridResult<Vec<u8>> {
    check_element_size(data, element_size)?;
    let n = data.len() / element_size;
    let bits = element_size * 8;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for b in 0..bits {
            let bit = (data[i * element_size + b / 8] >> (b % 8)) & 1;
            let pos = b * n + i;
            out[pos / 8] |= bit << (pos % 8);
        }
    }
    Ok(out)
}

fn bit_unshuffle(data: &[u8], element_size: usize) -> GridResult<Vec<u8>> {
    check_element_size(data, element_size)?;
    let n = data.len() / element_size;
    let bits = element_size * 8;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for b in 0..bits {
            let pos = b * n + i;
            let bit = (data[pos / 8] >> (pos % 8)) & 1;
            out[i * element_size + b / 8] |= bit << (b % 8);
        }
    }
    Ok(out)
}

fn element_width_checked(element_size: usize) -> GridResult<usize> {
    match element_size {
        1 | 2 | 4 | 8 => Ok(element_size),
        other => Err(GridError::Codec(format!(
            "delta filter requires a 1/2/4/8-byte element, got {other}"
        ))),
    }
}

fn read_element(data: &[u8], idx: usize, width: usize) -> i64 {
    let start = idx * width;
    let mut v: u64 = 0;
    for (i, byte) in data[start..start + width].iter().enumerate() {
        v |= u64::from(*byte) << (8 * i);
    }
    v as i64
}

fn write_element(out: &mut Vec<u8>, v: i64, width: usize) {
    let bytes = (v as u64).to_le_bytes();
    out.extend_from_slice(&bytes[..width]);
}

fn delta_encode(data: &[u8], element_size: usize) -> GridResult<Vec<u8>> {
    let width = element_width_checked(element_size)?;
    check_element_size(data, width)?;
    let n = data.len() / width;
    let mut out = Vec::with_capacity(data.len());
    let mut prev = 0i64;
    for i in 0..n {
        let v = read_element(data, i, width);
        write_element(&mut out, v.wrapping_sub(prev), width);
        prev = v;
    }
    Ok(out)
}

fn delta_decode(data: &[u8], element_size: usize) -> GridResult<Vec<u8>> {
    let width = element_width_checked(element_size)?;
    check_element_size(data, width)?;
    let n = data.len() / width;
    let mut out = Vec::with_capacity(data.len());
    let mut prev = 0i64;
    for i in 0..n {
        let v = prev.wrapping_add(read_element(data, i, width));
        write_element(&mut out, v, width);
        prev = v;
    }
    Ok(out)
}
