use std::io;
use thiserror::Error;

/// Every failure the codec, reader, reducer and writer can report.
///
/// All of them are fatal for the operation that raised them; nothing is
/// retried and no partial output is promoted.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid {what} magic at offset {offset}")]
    BadMagic { what: &'static str, offset: u64 },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// Fewer bytes than a record needs. `available == 0` at an extent
    /// boundary is the normal end of the cluster stream.
    #[error("Truncated at offset {offset}: wanted {expected} bytes, got {available}")]
    Truncated { offset: u64, expected: usize, available: usize },

    #[error("{what} checksum mismatch at offset {offset}")]
    ChecksumMismatch { what: &'static str, offset: u64 },

    #[error("Corrupt archive at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("Duplicate cluster {cluster} for device {device}")]
    DuplicateCluster { device: u8, cluster: u32 },

    #[error("Cannot determine device boundary: device {device} has {cached} clusters buffered while device {current} is incomplete")]
    BoundaryAmbiguity { current: u8, device: u8, cached: usize },

    #[error("Cluster for device {device} arrived too far inside device {current}'s region")]
    LateCluster { device: u8, current: u8 },

    #[error("Device {device} still has {pending} buffered clusters waiting for cluster {next}")]
    UnresolvedClusters { device: u8, next: u64, pending: usize },

    #[error("Too many {what} (limit {limit})")]
    Capacity { what: &'static str, limit: usize },

    #[error("Blob of {0} bytes does not fit a blob table entry")]
    BlobTooLarge(usize),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid device {device}: {reason}")]
    InvalidDevice { device: u8, reason: String },

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt { offset, reason: reason.into() }
    }

    /// True for the zero-byte short read that marks a clean end of stream.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, Error::Truncated { available: 0, .. })
    }
}
