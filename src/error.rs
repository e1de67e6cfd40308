//! Error types for voxstream

use crate::backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxStreamError {
    /// Device or context acquisition failed. Retry `init` later.
    #[error("Audio backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Voice allocation failed: {0}")]
    VoiceAllocationFailed(BackendError),

    #[error("Source open failed: {0}")]
    SourceOpenFailed(String),

    /// A buffer or queue operation failed; terminates the affected stream only.
    #[error("Backend call failed: {0}")]
    BackendCallFailed(#[from] BackendError),

    #[error("Not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(&'static str),
}

pub type Result<T> = std::result::Result<T, VoxStreamError>;
