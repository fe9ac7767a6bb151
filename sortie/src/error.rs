//! Error taxonomy for dispatch, lease, step, and teardown failures.

use std::path::PathBuf;

/// Pre-flight request validation failures.
///
/// These are the only errors [`crate::runtime::Dispatcher::submit`] raises
/// before any worker is launched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Identity and payload lists differ in length.
    #[error("identity count ({identities}) does not match payload count ({payloads})")]
    CountMismatch {
        /// Number of identity names supplied.
        identities: usize,
        /// Number of payloads supplied.
        payloads: usize,
    },

    /// A worker count of zero was requested.
    #[error("worker count must be at least 1")]
    ZeroWorkers,

    /// The dispatch target was blank.
    #[error("dispatch target is empty")]
    EmptyTarget,
}

/// Errors surfaced by the dispatch entrypoint.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Request rejected before launch.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The cached lease is not valid, so dispatch may not start.
    #[error("license lease is not valid")]
    LeaseInvalid,
}

/// Lease acquisition and verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// Network, timeout, or malformed response. Local state is left untouched.
    #[error("license authority unreachable: {0}")]
    Transient(String),

    /// Explicit denial (bad credential, inactive or expired license).
    #[error("license denied: {reason}")]
    Denied {
        /// Reason reported by the authority.
        reason: String,
    },

    /// The lease is already held by another machine.
    #[error("license already in use elsewhere (last access: {})", last_access.as_deref().unwrap_or("unknown"))]
    Conflict {
        /// Reason reported by the authority.
        reason: String,
        /// Last time the other holder was seen, as reported by the authority.
        last_access: Option<String>,
    },

    /// Verification was requested before any successful acquisition.
    #[error("no lease credentials cached")]
    NotAcquired,
}

impl LeaseError {
    /// Whether this failure must force local invalidation.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            LeaseError::Denied { .. } | LeaseError::Conflict { .. } | LeaseError::NotAcquired
        )
    }
}

/// Failure of a single state-machine step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Recoverable at the step's own granularity (skip or retry).
    #[error("transient step failure: {0}")]
    Transient(String),

    /// The item cannot proceed.
    #[error("{0}")]
    Fatal(String),
}

/// Failure of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// Another element intercepted the action; worth retrying.
    #[error("action intercepted: {0}")]
    Intercepted(String),

    /// Any other commit failure.
    #[error("commit failed: {0}")]
    Other(String),
}

/// A worker's isolated storage could not be fully removed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TeardownError {
    /// Every attempt failed; the directory is left behind.
    #[error("could not remove {} after {attempts} attempts: {last_error}", path.display())]
    Exhausted {
        /// Directory that could not be removed.
        path: PathBuf,
        /// Attempts made.
        attempts: u32,
        /// Last error observed.
        last_error: String,
    },
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the settings file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid JSON for the settings shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
