//! Failure taxonomy.
//!
//! Everything in this crate returns `anyhow::Result`. The leaf errors below
//! are attached where a failure has a definite class, so callers can decide
//! whether retrying the whole build makes sense:
//!
//! - [`ConfigError`]: bad input, never retryable.
//! - [`IntegrityError`]: corrupt or incomplete data, never retryable.
//! - [`Cancelled`]: the caller aborted the operation.
//! - anything else (I/O, network) is treated as transient.

use thiserror::Error;

/// Invalid or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required field `{field}` is not set for {target}")]
    MissingField { target: String, field: &'static str },

    #[error("cache path {0} exists but is not a directory")]
    CacheNotDirectory(String),

    #[error("unknown build mode `{0}` (expected manual, usb or iso)")]
    UnknownMode(String),

    #[error("unknown node kind `{0}` (expected control or node)")]
    UnknownKind(String),

    #[error("invalid artifact reference `{0}` (expected name:version)")]
    InvalidReference(String),

    #[error("{0}")]
    Invalid(String),
}

/// Data that is present but wrong.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("artifact {artifact} does not contain `{file}`")]
    MissingArtifactFile { artifact: String, file: String },

    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("partition table verification failed: {0}")]
    PartitionTable(String),

    #[error("boot image {0} is missing from the staged boot files")]
    MissingBootImage(String),
}

/// The operation was aborted through a [`crate::cache::Cancel`] handle.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Configuration,
    Integrity,
    Cancelled,
    Transient,
}

impl FailureKind {
    /// Only transient failures are worth a retry of the whole build.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// Classify an error by the first typed cause found in its chain.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return FailureKind::Configuration;
        }
        if cause.is::<IntegrityError>() {
            return FailureKind::Integrity;
        }
        if cause.is::<Cancelled>() {
            return FailureKind::Cancelled;
        }
    }
    FailureKind::Transient
}
