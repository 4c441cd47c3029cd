use std::io;
use thiserror::Error;

use crate::codec::CodecError;

/// Coarse classification of [`Error`], for callers that branch on the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Open,
    Read,
    Decode,
    Encode,
    NotFound,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Bad magic or a corrupt trailer/section table.
    #[error("Cannot open {what}: {reason}")]
    Open { what: &'static str, reason: String },
    #[error("IO error: {0}")]
    Read(#[from] io::Error),
    /// Decompression or payload layout failure.
    #[error("Decode error: {0}")]
    Decode(String),
    /// Input that the on-disk layout cannot represent.
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Section '{0}' not found")]
    NotFound(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Open { .. } => ErrorKind::Open,
            Error::Read(_)     => ErrorKind::Read,
            Error::Decode(_)   => ErrorKind::Decode,
            Error::Encode(_)   => ErrorKind::Encode,
            Error::NotFound(_) => ErrorKind::NotFound,
        }
    }

    pub(crate) fn open(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Open { what, reason: reason.into() }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
