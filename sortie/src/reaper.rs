//! Per-worker isolated storage and its retrying teardown.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, warn};
use walkdir::WalkDir;

use crate::config::ReaperConfig;
use crate::error::TeardownError;
use crate::telemetry;

/// Isolated storage region owned by exactly one worker.
///
/// Not `Clone`: a context is created by its worker and handed to [`teardown`]
/// when the worker finishes.
#[derive(Debug)]
pub struct WorkerContext {
    worker_index: usize,
    storage: PathBuf,
}

impl WorkerContext {
    /// Allocate a fresh directory under the system temp dir.
    pub fn allocate(worker_index: usize) -> io::Result<Self> {
        Self::allocate_in(&std::env::temp_dir(), worker_index)
    }

    /// Allocate a fresh directory under `base`.
    pub fn allocate_in(base: &Path, worker_index: usize) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("sortie-worker-{worker_index}-"))
            .tempdir_in(base)?;
        Ok(Self {
            worker_index,
            storage: dir.keep(),
        })
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }
}

/// Deletes a worker's storage tree. Each call is one teardown attempt.
pub trait StorageReclaimer: Send + Sync {
    fn reclaim(&self, path: &Path) -> io::Result<()>;
}

impl<F> StorageReclaimer for F
where
    F: Fn(&Path) -> io::Result<()> + Send + Sync,
{
    fn reclaim(&self, path: &Path) -> io::Result<()> {
        self(path)
    }
}

/// Remove a worker's storage, retrying with increasing backoff.
///
/// Returns the number of attempts used. Exhaustion is returned as an error for
/// the caller to record; it never panics.
pub async fn teardown(context: WorkerContext, config: &ReaperConfig) -> Result<u32, TeardownError> {
    teardown_using(context, config, Arc::new(remove_tree)).await
}

/// [`teardown`] with a custom reclaimer in place of [`remove_tree`].
pub async fn teardown_using(
    context: WorkerContext,
    config: &ReaperConfig,
    reclaimer: Arc<dyn StorageReclaimer>,
) -> Result<u32, TeardownError> {
    let span = telemetry::teardown_span(context.worker_index, &context.storage);
    teardown_with(&context.storage, config, reclaimer)
        .instrument(span)
        .await
}

async fn teardown_with(
    path: &Path,
    config: &ReaperConfig,
    reclaimer: Arc<dyn StorageReclaimer>,
) -> Result<u32, TeardownError> {
    if config.grace_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.grace_ms)).await;
    }

    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let reclaimer = reclaimer.clone();
        let target = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || reclaimer.reclaim(&target))
            .await
            .unwrap_or_else(|join| Err(io::Error::other(join.to_string())));

        match result {
            Ok(()) => {
                telemetry::record_teardown(path, attempt, true);
                return Ok(attempt);
            }
            Err(err) => {
                warn!(attempt, max_attempts, "teardown attempt failed: {err}");
                last_error = err.to_string();
            }
        }

        if attempt < max_attempts {
            let backoff = Duration::from_millis(config.backoff_ms * u64::from(attempt));
            tokio::time::sleep(backoff).await;
        }
    }

    telemetry::record_teardown(path, max_attempts, false);
    Err(TeardownError::Exhausted {
        path: path.to_path_buf(),
        attempts: max_attempts,
        last_error,
    })
}

/// Ordinary recursive delete, falling back to a permission-clearing walk.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => debug!(path = %path.display(), "recursive delete failed, walking: {err}"),
    }

    clear_permissions(path);

    for entry in WalkDir::new(path).contents_first(true) {
        let entry = entry.map_err(io::Error::other)?;
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }

    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Make every entry under `path` writable, top-down so each directory opens
/// up before its children are visited. Symlinks are left alone: changing
/// their mode would change their target's.
fn clear_permissions(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if entry.path_is_symlink() {
            continue;
        }
        make_writable(entry.path());
    }
}

fn make_writable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777));
    }
    #[cfg(not(unix))]
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_readonly(false);
        let _ = std::fs::set_permissions(path, perms);
    }
}
