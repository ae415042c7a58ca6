use thiserror::Error;

use blkrelay_backing::BackingError;

/// Failure to bring up a relay device.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    BackingOpen(#[from] BackingError),

    #[error("device registration failed: {0}")]
    Registration(#[from] RegistryError),
}

/// Failure to register a relay device.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device name {0:?} already registered")]
    DuplicateName(String),

    #[error("registry rejected device {name:?}: {reason}")]
    Rejected { name: String, reason: String },
}
