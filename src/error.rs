//! Error taxonomy for the execution log.
//!
//! Only I/O failures while opening or writing a tier surface to callers as
//! hard errors. Codec failures trigger tier re-derivation, source failures are
//! retried and end as an incomplete day, and lock contention is a normal
//! outcome reported through [`crate::day::FlushOutcome`].
use std::path::PathBuf;

use thiserror::Error;

use crate::day::Tier;

pub type Result<T> = std::result::Result<T, LogError>;

/// A malformed field inside one encoded record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("empty {0} field")]
    Empty(&'static str),
    #[error("byte {0:#04x} is not a digit of the record alphabet")]
    InvalidDigit(u8),
    #[error("{0} value overflows its type")]
    Overflow(&'static str),
    #[error("side token code {0} is out of range")]
    SideCode(u32),
    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// Failure talking to an archive or exchange.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source returned malformed data: {0}")]
    Malformed(String),
    #[error("{what} unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        what: String,
        attempts: usize,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{tier:?} tier {path} line {line}: {source}")]
    Codec {
        tier: Tier,
        path: PathBuf,
        line: usize,
        #[source]
        source: CodecError,
    },
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("metadata error on {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attaches a path to raw `std::io` results.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| LogError::io(path, e))
    }
}
