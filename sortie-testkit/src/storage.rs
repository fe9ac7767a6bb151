use parking_lot::Mutex;
use sortie::StorageReclaimer;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reclaimer for storage that can never be freed, as if a file inside it
/// stayed locked. Records every attempt.
#[derive(Clone, Default)]
pub struct LockedStorage {
    attempts: Arc<Mutex<Vec<PathBuf>>>,
}

impl LockedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempts_on(&self, path: &Path) -> usize {
        self.attempts.lock().iter().filter(|p| p.as_path() == path).count()
    }
}

impl StorageReclaimer for LockedStorage {
    fn reclaim(&self, path: &Path) -> io::Result<()> {
        self.attempts.lock().push(path.to_path_buf());
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} is locked", path.display()),
        ))
    }
}
