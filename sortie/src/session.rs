//! Collaborator seam for the remote service a worker drives.
//!
//! A [`SessionBackend`] opens one [`RemoteSession`] per worker, bound to that
//! worker's [`WorkerContext`]. The session is reused for every item in the
//! batch and closed before the context is torn down.

use async_trait::async_trait;

use crate::error::{CommitError, StepError};
use crate::identity::CredentialArtifact;
use crate::reaper::WorkerContext;

/// Opens execution handles against the remote service.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Start a session whose local state lives under `context.storage()`.
    async fn open(
        &self,
        context: &WorkerContext,
        throttling_flags: &[String],
    ) -> anyhow::Result<Box<dyn RemoteSession>>;
}

/// A live execution handle. Owned by exactly one worker.
#[async_trait]
pub trait RemoteSession: Send {
    /// Load `url`.
    async fn navigate(&mut self, url: &str) -> Result<(), StepError>;

    /// Readiness of the current page.
    ///
    /// `None` means the session exposes no readiness signal, in which case the
    /// worker falls back to a fixed settle delay.
    async fn is_ready(&mut self) -> Option<bool> {
        None
    }

    /// Install one credential artifact into the session.
    async fn inject_artifact(&mut self, artifact: &CredentialArtifact) -> Result<(), StepError>;

    /// Look once for the interactive target. `Ok(false)` means not present yet.
    async fn locate_target(&mut self) -> Result<bool, StepError>;

    /// Replace the target's content with `payload`.
    async fn set_payload(&mut self, payload: &str) -> Result<(), StepError>;

    /// Ordinary commit action.
    async fn commit(&mut self) -> Result<(), CommitError>;

    /// Low-level commit used once ordinary attempts are exhausted.
    async fn force_commit(&mut self) -> Result<(), CommitError>;

    /// Positive acceptance signal for the last commit, if the remote exposes one.
    async fn acceptance(&mut self) -> Option<bool> {
        None
    }

    /// Shut the session down and let its processes exit.
    async fn close(&mut self) -> anyhow::Result<()>;
}
