// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Variable-length integer codec: little-endian 7-bit payloads, high bit set
//! while more bytes follow. Signed values use the final byte's 0x40 bit for
//! sign extension.

use crate::error::{DecodeError, ErrorKind, Result};
use std::io::Read;

/// A varint never spans more than 10 bytes (64 bit / 7 bit per byte).
pub const MAX_VARINT_LEN: usize = 10;

/// Reads an unsigned varint, returning the value and its encoded length.
#[inline]
pub fn read_varint_u64(input: &mut impl Read) -> Result<(u64, usize)> {
    let mut byte = [0u8; 1];
    let mut res = 0u64;
    for ii in 0..MAX_VARINT_LEN {
        input.read_exact(&mut byte)?;
        res |= ((byte[0] & 0x7f) as u64) << (7 * ii);
        if byte[0] & 0x80 == 0 {
            return Ok((res, ii + 1));
        }
    }
    Err(DecodeError::new(
        ErrorKind::InvalidNumeric,
        "varint did not terminate within 10 bytes",
    ))
}

/// Reads a signed varint. The final byte's 0x40 bit sign-extends the result
/// when the shift has not yet consumed all 64 bits.
#[inline]
pub fn read_varint_i64(input: &mut impl Read) -> Result<(i64, usize)> {
    let mut byte = [0u8; 1];
    let mut res = 0i64;
    for ii in 0..MAX_VARINT_LEN {
        input.read_exact(&mut byte)?;
        let shift_by = 7 * ii;
        res |= ((byte[0] & 0x7f) as i64) << shift_by;
        if byte[0] & 0x80 == 0 {
            if shift_by < 64 - 7 && byte[0] & 0x40 != 0 {
                res |= -1i64 << (shift_by + 7);
            }
            return Ok((res, ii + 1));
        }
    }
    Err(DecodeError::new(
        ErrorKind::InvalidNumeric,
        "signed varint did not terminate within 10 bytes",
    ))
}

/// Number of bytes `value` occupies on the wire. Used to compute section
/// layout offsets without a second decode.
#[inline]
pub fn varint_size(mut value: u64) -> usize {
    for len in 1..=MAX_VARINT_LEN {
        value >>= 7;
        if value == 0 {
            return len;
        }
    }
    MAX_VARINT_LEN
}

/// Encodes an unsigned varint. Only used by fixture builders in tests, but
/// kept next to the decoder so the two stay in sync.
#[cfg(test)]
pub fn write_varint_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let next = value >> 7;
        if next == 0 {
            out.push((value & 0x7f) as u8);
            return;
        }
        out.push((value & 0x7f) as u8 | 0x80);
        value = next;
    }
}

/// Encodes a signed varint in the wire form `read_varint_i64` understands.
#[cfg(test)]
pub fn write_varint_i64(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let bits = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && bits & 0x40 == 0) || (value == -1 && bits & 0x40 != 0);
        if done {
            out.push(bits);
            return;
        }
        out.push(bits | 0x80);
    }
}
