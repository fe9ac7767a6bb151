use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SortieConfig;
use crate::identity::{IdentityStore, SharedIdentityAccessor};
use crate::reaper::{self, StorageReclaimer};
use crate::reporter::{ErrorReporter, NoopReporter};
use crate::session::SessionBackend;

use super::supervisor::Dispatcher;
use super::worker::WorkerDeps;

/// Builder for a [`Dispatcher`] with explicit collaborators.
///
/// The session backend and identity store are required. The error reporter
/// defaults to [`NoopReporter`] and worker storage to the system temp dir.
///
/// # Example
///
/// ```ignore
/// use sortie::*;
///
/// let dispatcher = DispatcherBuilder::new(config)
///     .with_backend(backend)
///     .with_identity_store(store)
///     .with_reporter(reporter)
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    config: SortieConfig,
    backend: Option<Arc<dyn SessionBackend>>,
    identity_store: Option<Arc<dyn IdentityStore>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    storage_base: Option<PathBuf>,
    reclaimer: Option<Arc<dyn StorageReclaimer>>,
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("backend_set", &self.backend.is_some())
            .field("identity_store_set", &self.identity_store.is_some())
            .field("reporter_set", &self.reporter.is_some())
            .field("storage_base", &self.storage_base)
            .field("reclaimer_set", &self.reclaimer.is_some())
            .finish()
    }
}

impl DispatcherBuilder {
    pub fn new(config: SortieConfig) -> Self {
        Self {
            config,
            backend: None,
            identity_store: None,
            reporter: None,
            storage_base: None,
            reclaimer: None,
        }
    }

    /// Set the backend that opens one session per worker.
    pub fn with_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the store identities are looked up in.
    pub fn with_identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Allocate worker storage under `base` instead of the system temp dir.
    pub fn with_storage_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.storage_base = Some(base.into());
        self
    }

    /// Replace the default recursive delete used by worker teardown.
    pub fn with_storage_reclaimer(mut self, reclaimer: Arc<dyn StorageReclaimer>) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if a required collaborator is missing.
    pub fn build(self) -> anyhow::Result<Dispatcher> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("session backend dependency missing"))?;
        let store = self
            .identity_store
            .ok_or_else(|| anyhow::anyhow!("identity store dependency missing"))?;
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(NoopReporter));

        let deps = WorkerDeps {
            backend,
            accessor: SharedIdentityAccessor::new(store),
            reporter,
            session: Arc::new(self.config.session),
            reaper: self.config.reaper,
            reclaimer: self
                .reclaimer
                .unwrap_or_else(|| Arc::new(reaper::remove_tree)),
            storage_base: self.storage_base,
        };
        Ok(Dispatcher::new(self.config.dispatch, deps))
    }
}
