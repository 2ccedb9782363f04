use crate::{
    coding::{DecodeError, EncodeError},
    version::Version,
};

/// Represents errors that can occur in the store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A data file failed its checksum or framing check
    Corrupt(&'static str),

    /// Invalid key, value or range supplied by the caller
    InvalidArgument(&'static str),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// A fold worker exited abnormally
    FoldWorkerDied,

    /// The store was closed, or hit a fatal write error earlier and
    /// must be reopened
    Poisoned,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Store result
pub type Result<T> = std::result::Result<T, Error>;
