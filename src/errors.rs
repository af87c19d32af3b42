// src/errors.rs

//! Structured error types for the orchestration core.
//!
//! The core never signals an expected branch by panicking: configuration
//! drift, missing export channels, failed submissions and artifact I/O all
//! surface as variants here. Application-boundary code (`lib.rs`, the config
//! loader) wraps these in `anyhow` for context.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias for the orchestration core.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A persisted stage and a freshly-requested stage disagree on a field
    /// that is not in the safe allow-list. Raised before any persisted state
    /// is mutated.
    #[error(
        "stage '{stage}': field '{field}' differs from the checkpointed value and is not safe to change"
    )]
    ConfigConflict { stage: String, field: String },

    /// A consumer asked a completed producer for a channel it never produced.
    #[error("producer stage '{producer}' has no export channel '{channel}'")]
    MissingChannel { producer: String, channel: String },

    /// The batch system rejected a bundle. Recoverable: nothing is mutated
    /// and the bundle is retried on the next bundling pass.
    #[error("batch submission failed: {0}")]
    Submission(String),

    /// An expected file was missing or unreadable. Recoverable: the tick that
    /// hit it left state unchanged and will retry.
    #[error("artifact i/o at {path:?}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A checkpoint could not be serialized, parsed, or replaced.
    #[error("checkpoint at {path:?}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
}

impl OrchestratorError {
    /// Errors the tick loop may log and retry, as opposed to ones that must
    /// stop the driver (conflicts, missing channels, broken checkpoints).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Submission(_) | OrchestratorError::ArtifactIo { .. }
        )
    }
}
