// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Uniform gateway over the decompression algorithms the binary trace and
//! the hierarchy blocks use. Every operation takes the compressed bytes and
//! the declared uncompressed size and produces an owned buffer.

use crate::error::{DecodeError, ErrorKind, Result};
use crate::fastlz;
use std::io::Read;

/// Algorithm tag for a compressed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Zlib,
    Gzip,
    Lz4,
    Lz4Duo,
    FastLz,
}

/// Outcome of a decompression: the bytes, and whether the algorithm produced
/// fewer bytes than declared. The caller decides whether a short decode is
/// acceptable (frame section) or fatal (value-change chunks).
pub struct Decoded {
    pub bytes: Vec<u8>,
    pub short: bool,
}

impl Decoded {
    fn full(bytes: Vec<u8>) -> Self {
        Decoded { bytes, short: false }
    }

    /// Fails with a `DecompressionFailure` if the decode came up short.
    pub fn require_full(self) -> Result<Vec<u8>> {
        if self.short {
            return Err(DecodeError::new(
                ErrorKind::DecompressionFailure,
                "decompressor produced fewer bytes than declared",
            ));
        }
        Ok(self.bytes)
    }
}

/// Decompresses `input` into exactly `expected` bytes, or a short buffer
/// where the policy allows it.
pub fn decompress(codec: Codec, input: &[u8], expected: usize) -> Result<Decoded> {
    match codec {
        Codec::None => {
            if input.len() != expected {
                return Err(DecodeError::new(
                    ErrorKind::DecompressionFailure,
                    format!(
                        "uncompressed section length {} does not match declared size {expected}",
                        input.len()
                    ),
                ));
            }
            Ok(Decoded::full(input.to_vec()))
        }
        Codec::Zlib => inflate_zlib(input, expected),
        Codec::Gzip => {
            let mut out = Vec::with_capacity(expected);
            let mut decoder = flate2::read::GzDecoder::new(input);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| DecodeError::new(ErrorKind::DecompressionFailure, e.to_string()))?;
            out.truncate(expected);
            let short = out.len() < expected;
            Ok(Decoded { bytes: out, short })
        }
        Codec::Lz4 => {
            let bytes = lz4_flex::block::decompress(input, expected)
                .map_err(|e| DecodeError::new(ErrorKind::DecompressionFailure, e.to_string()))?;
            let short = bytes.len() < expected;
            Ok(Decoded { bytes, short })
        }
        Codec::Lz4Duo => {
            // the first stage's size is not recorded; start at four times the
            // input and widen until the stage fits
            let mut capacity = input.len().saturating_mul(4).max(64);
            let stage1 = loop {
                match lz4_flex::block::decompress(input, capacity) {
                    Ok(bytes) => break bytes,
                    Err(_) if capacity < expected.saturating_mul(4).max(1 << 20) => {
                        capacity *= 2;
                    }
                    Err(e) => {
                        return Err(DecodeError::new(
                            ErrorKind::DecompressionFailure,
                            format!("lz4 first stage: {e}"),
                        ))
                    }
                }
            };
            let bytes = lz4_flex::block::decompress(&stage1, expected).map_err(|e| {
                DecodeError::new(ErrorKind::DecompressionFailure, format!("lz4 second stage: {e}"))
            })?;
            let short = bytes.len() < expected;
            Ok(Decoded { bytes, short })
        }
        Codec::FastLz => {
            let bytes = fastlz::decompress(input, expected)?;
            let short = bytes.len() < expected;
            Ok(Decoded { bytes, short })
        }
    }
}

/// Zlib inflate with the partial-output policy: whatever came out before the
/// stream ended is returned, flagged as short when below the declared size.
fn inflate_zlib(input: &[u8], expected: usize) -> Result<Decoded> {
    let mut decomp = flate2::Decompress::new(true);
    let mut out = Vec::with_capacity(expected);
    let status = decomp
        .decompress_vec(input, &mut out, flate2::FlushDecompress::Finish)
        .map_err(|e| DecodeError::new(ErrorKind::DecompressionFailure, e.to_string()))?;
    // a second call drains pending output when the first filled the buffer
    if status == flate2::Status::Ok && out.len() < expected {
        decomp
            .decompress_vec(&[], &mut out, flate2::FlushDecompress::Finish)
            .map_err(|e| DecodeError::new(ErrorKind::DecompressionFailure, e.to_string()))?;
    }
    let short = out.len() < expected;
    Ok(Decoded { bytes: out, short })
}

/// Helper for sections that are stored raw when the compressed and the
/// uncompressed lengths agree, zlib-compressed otherwise.
pub fn maybe_zlib(input: &[u8], expected: usize) -> Result<Decoded> {
    if input.len() == expected {
        Ok(Decoded::full(input.to_vec()))
    } else {
        inflate_zlib(input, expected)
    }
}
