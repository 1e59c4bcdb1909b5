// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Buffered byte-range access in the two shapes the decoders need: an
//! array-backed view with absolute seeking for decoded blocks, and a
//! bounded-memory refillable view over an input stream.

use crate::error::{DecodeError, Result};
use std::io::Read;

/// Internal buffer size of the stream-backed reader.
pub const STREAM_BUFFER_SIZE: usize = 16 * 1024;

/// Window size of the text token buffer.
pub const TOKEN_BUFFER_SIZE: usize = 64 * 1024;

/// Array-backed reader over an owned or borrowed block. Supports absolute
/// seeking and position queries.
pub struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BlockReader { data, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(DecodeError::eof(format!(
                "seek to {pos} beyond block of {} bytes",
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.seek(self.pos + count)
    }

    pub fn take_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(DecodeError::eof(format!(
                "need {count} bytes, {} remain in block",
                self.remaining()
            ))
            .with_offset(self.pos as u64));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_bytes(1)?[0])
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take_bytes(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = buf.len().min(self.remaining());
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        Ok(count)
    }
}

/// Stream-backed reader with a fixed internal buffer. `ensure_available`
/// refills by copying the residual bytes to the buffer head and reading more
/// from the producer; there is no absolute seek.
pub struct StreamReader<R> {
    input: R,
    buffer: Box<[u8; STREAM_BUFFER_SIZE]>,
    pos: usize,
    limit: usize,
    total_read: u64,
}

impl<R: Read> StreamReader<R> {
    pub fn new(input: R) -> Self {
        StreamReader {
            input,
            buffer: Box::new([0u8; STREAM_BUFFER_SIZE]),
            pos: 0,
            limit: 0,
            total_read: 0,
        }
    }

    /// Total bytes handed out so far; used for error offsets and progress.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.total_read
    }

    /// Returns true once the producer is exhausted and the buffer drained.
    pub fn at_eof(&mut self) -> Result<bool> {
        if self.pos < self.limit {
            return Ok(false);
        }
        Ok(!self.fill_some()?)
    }

    /// Makes sure at least `needed` bytes are buffered.
    fn ensure_available(&mut self, needed: usize) -> Result<()> {
        debug_assert!(needed <= STREAM_BUFFER_SIZE);
        while self.limit - self.pos < needed {
            if !self.fill_some()? {
                return Err(DecodeError::eof(format!(
                    "end of input, needed {needed} bytes but {} were available",
                    self.limit - self.pos
                ))
                .with_offset(self.total_read));
            }
        }
        Ok(())
    }

    /// One refill step: compacts the residue to the head, then reads more.
    /// Returns false when the producer has no more bytes.
    fn fill_some(&mut self) -> Result<bool> {
        if self.pos > 0 {
            self.buffer.copy_within(self.pos..self.limit, 0);
            self.limit -= self.pos;
            self.pos = 0;
        }
        let read = self.input.read(&mut self.buffer[self.limit..])?;
        self.limit += read;
        Ok(read > 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_available(1)?;
        let byte = self.buffer[self.pos];
        self.pos += 1;
        self.total_read += 1;
        Ok(byte)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_available(8)?;
        let bytes: [u8; 8] = self.buffer[self.pos..self.pos + 8].try_into().unwrap();
        self.pos += 8;
        self.total_read += 8;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Reads exactly `count` bytes into an owned buffer.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count];
        self.read_exact_into(&mut out)?;
        Ok(out)
    }

    pub fn read_exact_into(&mut self, out: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < out.len() {
            if self.pos == self.limit && !self.fill_some()? {
                return Err(DecodeError::eof(format!(
                    "end of input after {written} of {} bytes",
                    out.len()
                ))
                .with_offset(self.total_read));
            }
            let chunk = (out.len() - written).min(self.limit - self.pos);
            out[written..written + chunk]
                .copy_from_slice(&self.buffer[self.pos..self.pos + chunk]);
            self.pos += chunk;
            self.total_read += chunk as u64;
            written += chunk;
        }
        Ok(())
    }

    pub fn skip(&mut self, mut count: u64) -> Result<()> {
        while count > 0 {
            if self.pos == self.limit && !self.fill_some()? {
                return Err(DecodeError::eof(format!(
                    "end of input with {count} bytes left to skip"
                ))
                .with_offset(self.total_read));
            }
            let chunk = count.min((self.limit - self.pos) as u64);
            self.pos += chunk as usize;
            self.total_read += chunk;
            count -= chunk;
        }
        Ok(())
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos == self.limit {
            let more = self
                .fill_some()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            if !more {
                return Ok(0);
            }
        }
        let count = buf.len().min(self.limit - self.pos);
        buf[..count].copy_from_slice(&self.buffer[self.pos..self.pos + count]);
        self.pos += count;
        self.total_read += count as u64;
        Ok(count)
    }
}

/// Refillable window for the text parser. The parser consumes only complete
/// tokens; the unconsumed tail is carried to the window head on refill, and
/// a synthetic whitespace byte terminates the final token at end of input.
pub struct TokenBuffer<R> {
    input: R,
    buffer: Vec<u8>,
    len: usize,
    consumed_total: u64,
    source_done: bool,
    final_ws_inserted: bool,
}

impl<R: Read> TokenBuffer<R> {
    pub fn new(input: R) -> Self {
        TokenBuffer {
            input,
            buffer: vec![0u8; TOKEN_BUFFER_SIZE],
            len: 0,
            consumed_total: 0,
            source_done: false,
            final_ws_inserted: false,
        }
    }

    /// Total bytes consumed by the parser so far.
    pub fn offset(&self) -> u64 {
        self.consumed_total
    }

    /// Fills the window and returns the parseable slice, or `None` once the
    /// input and the carried tail are exhausted.
    pub fn fill(&mut self) -> Result<Option<&[u8]>> {
        while !self.source_done && self.len < self.buffer.len() {
            let read = self.input.read(&mut self.buffer[self.len..])?;
            if read == 0 {
                self.source_done = true;
            } else {
                self.len += read;
            }
        }
        if self.source_done && !self.final_ws_inserted && self.len < self.buffer.len() {
            self.buffer[self.len] = b' ';
            self.len += 1;
            self.final_ws_inserted = true;
        }
        if self.len == 0 {
            return Ok(None);
        }
        Ok(Some(&self.buffer[..self.len]))
    }

    /// Drops `used` bytes and carries the rest to the head of the window.
    /// Returns an error when no progress is possible on a full window.
    pub fn consume(&mut self, used: usize) -> Result<()> {
        debug_assert!(used <= self.len);
        if used == 0 && self.source_done {
            return Err(DecodeError::new(
                crate::error::ErrorKind::InvalidCommand,
                "unable to parse remaining data in buffer",
            )
            .with_offset(self.consumed_total));
        }
        if used == 0 && self.len == self.buffer.len() {
            return Err(DecodeError::new(
                crate::error::ErrorKind::InvalidCommand,
                "token or command exceeds the parse window",
            )
            .with_offset(self.consumed_total));
        }
        self.buffer.copy_within(used..self.len, 0);
        self.len -= used;
        self.consumed_total += used as u64;
        Ok(())
    }

    /// True once everything, including the synthetic whitespace, is consumed.
    pub fn done(&self) -> bool {
        self.source_done && self.final_ws_inserted && self.len == 0
    }
}
