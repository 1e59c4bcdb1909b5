// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! waverec imports digital-simulation waveform dumps into an in-memory
//! record model: time-stamped value changes of signals organized in a scope
//! hierarchy. Two industry formats are supported, the VCD text dump and the
//! FST block-structured binary trace.
//!
//! ```no_run
//! use waverec::{LoadConfig, Progress};
//!
//! let file = std::fs::File::open("dump.vcd").unwrap();
//! let record = waverec::read_text_dump(file, &LoadConfig::default(), &Progress::new()).unwrap();
//! for id in 0..record.signals.len() {
//!     println!("{}", record.signal_full_name(id));
//! }
//! ```

mod buffer;
mod compress;
mod error;
mod fastlz;
pub mod fst;
mod index;
mod progress;
mod record;
mod tokens;
mod variable;
mod varint;
pub mod vcd;

pub use error::{DecodeError, ErrorKind};
pub use progress::Progress;
pub use record::{
    DataKind, EventSample, FloatSample, LogicSample, Record, SampleWriter, ScopeId, ScopeTree,
    SignalId, SignalMeta, TextSample, TimeBase, TimeUnit, WriterId,
};
pub use tokens::{
    LogicLevel, STATE_0, STATE_1, STATE_D, STATE_H, STATE_L, STATE_U, STATE_W, STATE_X, STATE_Z,
};
pub use variable::{BitRange, FilterList, VarRecord};

/// Cargo.toml version of this library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum FileFormat {
    Vcd,
    Fst,
    Unknown,
}

/// Guesses the file format from the first few bytes of the input.
pub fn detect_format(prefix: &[u8]) -> FileFormat {
    if fst::looks_like_binary_trace(prefix) {
        FileFormat::Fst
    } else if vcd::looks_like_text_dump(prefix) {
        FileFormat::Vcd
    } else {
        FileFormat::Unknown
    }
}

/// Configuration surface shared by both decoders. Time-valued entries are
/// strings parsed against the record's domain base once it is established.
#[derive(Debug, Clone, Default)]
pub struct LoadConfig {
    /// Regex; when non-empty, signal names are split on it to build extra
    /// scope levels after the initial parse.
    pub hierarchy: Option<String>,
    /// Group consecutive single-bit declarations into vectors.
    pub vector: bool,
    /// Keep scopes that have no signals under them.
    pub empty: bool,
    /// Filter expressions selecting signals to import.
    pub include: Option<String>,
    pub exclude: Option<String>,
    /// Time bounds in domain-base units; defaults to the full range.
    pub start: Option<String>,
    pub end: Option<String>,
    /// Offset in domain-base units added to every raw timestamp.
    pub delay: Option<String>,
    /// Multiplier applied after the delay.
    pub dilate: Option<f64>,
}

/// Top-level error as produced by the convenience readers.
#[derive(Debug, thiserror::Error)]
pub enum WaverecError {
    #[error("failed to load {0:?} input:\n{1}")]
    FailedToLoad(FileFormat, DecodeError),
    #[error("unknown file format, only FST and VCD are supported")]
    UnknownFileFormat,
    #[error("io error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WaverecError>;

/// Reads a VCD text dump.
pub fn read_text_dump(
    input: impl std::io::Read,
    config: &LoadConfig,
    progress: &Progress,
) -> Result<Record> {
    vcd::read(input, config, progress).map_err(|e| WaverecError::FailedToLoad(FileFormat::Vcd, e))
}

/// Reads an FST binary trace.
pub fn read_binary_trace<'a>(
    input: impl std::io::Read + 'a,
    config: &LoadConfig,
    progress: &Progress,
) -> Result<Record> {
    fst::read(input, config, progress).map_err(|e| WaverecError::FailedToLoad(FileFormat::Fst, e))
}

/// Detects the format from the buffered prefix and dispatches accordingly.
pub fn read_auto(
    input: &[u8],
    config: &LoadConfig,
    progress: &Progress,
) -> Result<Record> {
    match detect_format(input) {
        FileFormat::Vcd => read_text_dump(input, config, progress),
        FileFormat::Fst => read_binary_trace(input, config, progress),
        FileFormat::Unknown => Err(WaverecError::UnknownFileFormat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"$date today $end"), FileFormat::Vcd);
        let mut header = vec![0u8];
        header.extend_from_slice(&329u64.to_be_bytes());
        assert_eq!(detect_format(&header), FileFormat::Fst);
        assert_eq!(detect_format(b"\x7fELF"), FileFormat::Unknown);
    }
}
