// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Decode error model shared by both decoders.

/// Category of a decode failure. Recoverable conditions are logged by the
/// decoders and never surface as an `ErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A byte whose token class is invalid at this point of the input.
    InvalidToken,
    /// A malformed or unknown command.
    InvalidCommand,
    /// A number that could not be parsed (time, width, real value, varint).
    InvalidNumeric,
    /// Input ended inside a construct or a binary section.
    UnexpectedEof,
    /// A model invariant was violated (shared handles with different widths,
    /// real/text variables with bit indices, out-of-order timestamps, ...).
    InvariantViolation,
    /// A decompressor rejected its input or came up short where it must not.
    DecompressionFailure,
    /// Recognized but not implemented (plain value-change blocks).
    UnsupportedFeature,
    /// Cooperative cancellation was observed.
    CancelRequested,
    /// An I/O error from the underlying input.
    Io,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidToken => "invalid token",
            ErrorKind::InvalidCommand => "invalid command",
            ErrorKind::InvalidNumeric => "invalid numeric",
            ErrorKind::UnexpectedEof => "unexpected end of input",
            ErrorKind::InvariantViolation => "invariant violation",
            ErrorKind::DecompressionFailure => "decompression failure",
            ErrorKind::UnsupportedFeature => "unsupported feature",
            ErrorKind::CancelRequested => "cancelled",
            ErrorKind::Io => "i/o error",
        }
    }
}

/// A structured decode error: kind, message, byte offset when known and a
/// single-line snippet with a `|` marker at the offending byte.
#[derive(Debug)]
pub struct DecodeError {
    pub kind: ErrorKind,
    pub message: String,
    pub offset: Option<u64>,
    pub snippet: Option<String>,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if let Some(offset) = self.offset {
            write!(f, " at byte {offset}")?;
        }
        if let Some(snippet) = &self.snippet {
            write!(f, "\n  {snippet}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DecodeError {}

impl DecodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        DecodeError {
            kind,
            message: message.into(),
            offset: None,
            snippet: None,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Attaches the line surrounding `pos` in `buffer`, with a `|` marker
    /// inserted at the offending byte.
    pub fn with_snippet(mut self, buffer: &[u8], pos: usize) -> Self {
        self.snippet = Some(extract_snippet(buffer, pos));
        self
    }

    pub fn eof(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnexpectedEof, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        let kind = if value.kind() == std::io::ErrorKind::UnexpectedEof {
            ErrorKind::UnexpectedEof
        } else {
            ErrorKind::Io
        };
        DecodeError::new(kind, value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Cuts the line containing `pos` out of `buffer` and inserts a `|` marker
/// in front of the offending byte. Control bytes are replaced so the snippet
/// stays a single printable line.
fn extract_snippet(buffer: &[u8], pos: usize) -> String {
    let pos = pos.min(buffer.len());
    let line_start = buffer[..pos]
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    let line_end = buffer[pos..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|p| pos + p)
        .unwrap_or(buffer.len());
    let mut out = String::with_capacity(line_end - line_start + 1);
    for (ii, b) in buffer[line_start..line_end].iter().enumerate() {
        if line_start + ii == pos {
            out.push('|');
        }
        let c = *b as char;
        out.push(if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
    }
    if line_start + (line_end - line_start) == pos {
        out.push('|');
    }
    out
}
