use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackingError>;

/// Errors raised while opening or driving a backing store.
///
/// Only the open-time variants ([`BackingError::Open`], [`BackingError::TooSmall`])
/// reach callers as `Err` values. Per-request failures are logged with their
/// structured variant and then collapsed to an `IoError` completion status, so
/// submitters see the same two-state outcome a block layer would report.
#[derive(Debug, Error)]
pub enum BackingError {
    #[error("failed to open backing device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("backing device {path} too small: {len} bytes")]
    TooSmall { path: PathBuf, len: u64 },

    #[error("out of bounds: sector={sector} sectors={sectors} capacity={capacity}")]
    OutOfBounds {
        sector: u64,
        sectors: u64,
        capacity: u64,
    },

    #[error("unaligned transfer length {len} (expected multiple of 512)")]
    UnalignedLength { len: usize },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
