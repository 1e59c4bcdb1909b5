// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! FastLZ block decompression (levels 1 and 2), used for value-change chunks
//! whose pack type is `F`. No crates.io decoder matches the exact byte
//! format, so the decoder lives here, next to the gateway that calls it.

use crate::error::{DecodeError, ErrorKind, Result};

const MAX_L2_DISTANCE: usize = 8191;

fn short_input() -> DecodeError {
    DecodeError::new(ErrorKind::DecompressionFailure, "fastlz input truncated")
}

fn bad_match() -> DecodeError {
    DecodeError::new(
        ErrorKind::DecompressionFailure,
        "fastlz match reaches before the start of the output",
    )
}

/// Decompresses a FastLZ block. The first byte's top three bits select the
/// compression level.
pub fn decompress(input: &[u8], max_out: usize) -> Result<Vec<u8>> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    match input[0] >> 5 {
        0 => decompress_level1(input, max_out),
        1 => decompress_level2(input, max_out),
        other => Err(DecodeError::new(
            ErrorKind::DecompressionFailure,
            format!("unknown fastlz level {}", other + 1),
        )),
    }
}

fn copy_match(out: &mut Vec<u8>, distance: usize, len: usize) -> Result<()> {
    if distance == 0 || distance > out.len() {
        return Err(bad_match());
    }
    let start = out.len() - distance;
    // overlapping copies replicate byte by byte
    for ii in 0..len {
        let b = out[start + ii];
        out.push(b);
    }
    Ok(())
}

fn decompress_level1(input: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(max_out);
    let mut ip = 0usize;
    let mut ctrl = (input[ip] & 31) as usize;
    ip += 1;
    loop {
        if ctrl >= 32 {
            // match: length = (ctrl >> 5) + 2, distance = ((ctrl & 31) << 8 | next) + 1
            let mut len = (ctrl >> 5) + 2;
            if len == 9 {
                len += *input.get(ip).ok_or_else(short_input)? as usize;
                ip += 1;
            }
            let ofs = (ctrl & 31) << 8;
            let distance = ofs + *input.get(ip).ok_or_else(short_input)? as usize + 1;
            ip += 1;
            copy_match(&mut out, distance, len)?;
        } else {
            // literal run of ctrl + 1 bytes
            let run = ctrl + 1;
            let end = ip.checked_add(run).filter(|e| *e <= input.len()).ok_or_else(short_input)?;
            out.extend_from_slice(&input[ip..end]);
            ip = end;
        }
        if ip >= input.len() {
            return Ok(out);
        }
        ctrl = input[ip] as usize;
        ip += 1;
    }
}

fn decompress_level2(input: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(max_out);
    let mut ip = 0usize;
    let mut ctrl = (input[ip] & 31) as usize;
    ip += 1;
    loop {
        if ctrl >= 32 {
            let mut len = (ctrl >> 5) + 2;
            let ofs = (ctrl & 31) << 8;
            if len == 9 {
                // run-length extension bytes, 255 marks continuation
                loop {
                    let code = *input.get(ip).ok_or_else(short_input)? as usize;
                    ip += 1;
                    len += code;
                    if code != 255 {
                        break;
                    }
                }
            }
            let code = *input.get(ip).ok_or_else(short_input)? as usize;
            ip += 1;
            let mut distance = ofs + code + 1;
            if code == 255 && ofs == 31 << 8 {
                // long-distance match with explicit 16-bit offset
                let hi = *input.get(ip).ok_or_else(short_input)? as usize;
                let lo = *input.get(ip + 1).ok_or_else(short_input)? as usize;
                ip += 2;
                distance = (hi << 8) + lo + MAX_L2_DISTANCE + 1;
            }
            copy_match(&mut out, distance, len)?;
        } else {
            let run = ctrl + 1;
            let end = ip.checked_add(run).filter(|e| *e <= input.len()).ok_or_else(short_input)?;
            out.extend_from_slice(&input[ip..end]);
            ip = end;
        }
        if ip >= input.len() {
            return Ok(out);
        }
        ctrl = input[ip] as usize;
        ip += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_only_level1() {
        // header byte: level 1, literal run of 5
        let input = [4u8, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(decompress(&input, 16).unwrap(), b"hello");
    }

    #[test]
    fn test_match_level1() {
        // "abc" literal, then a 3-byte match at distance 3 -> "abcabc"
        let input = [2u8, b'a', b'b', b'c', 0x20, 0x02];
        assert_eq!(decompress(&input, 16).unwrap(), b"abcabc");
    }

    #[test]
    fn test_run_level1() {
        // "a" literal, then a 4-byte match at distance 1 -> "aaaaa"
        let input = [0u8, b'a', 0x40, 0x00];
        assert_eq!(decompress(&input, 16).unwrap(), b"aaaaa");
    }

    #[test]
    fn test_long_match_level1() {
        // literal "ab", match ctrl 7<<5 with extension 3 -> len 2+7+3 = 12
        let input = [1u8, b'a', b'b', 0xe0, 0x03, 0x01];
        assert_eq!(decompress(&input, 32).unwrap(), b"ab".repeat(7));
    }

    #[test]
    fn test_literal_only_level2() {
        // header byte: level 2 (0x20), literal run of 3
        let input = [0x20 | 2u8, b'x', b'y', b'z'];
        assert_eq!(decompress(&input, 16).unwrap(), b"xyz");
    }

    #[test]
    fn test_match_level2() {
        let input = [0x20 | 2u8, b'a', b'b', b'c', 0x20, 0x02];
        assert_eq!(decompress(&input, 16).unwrap(), b"abcabc");
    }

    #[test]
    fn test_truncated_input_fails() {
        let input = [2u8, b'a'];
        let err = decompress(&input, 16).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DecompressionFailure);
    }

    #[test]
    fn test_bad_distance_fails() {
        // match at distance 5 with only one byte of output
        let input = [0u8, b'a', 0x20, 0x04];
        assert!(decompress(&input, 16).is_err());
    }
}
