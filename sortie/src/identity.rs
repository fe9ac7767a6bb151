//! Identity and content records, their folder-based store, and the shared
//! accessor workers use to look identities up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Folder every store starts with and that cannot be removed.
pub const DEFAULT_FOLDER: &str = "default";

/// One stored credential artifact (for example a session cookie).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialArtifact {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A stored identity the dispatcher acts on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    /// Account used when reporting failures; falls back to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, alias = "cookies")]
    pub artifacts: Vec<CredentialArtifact>,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_artifact(mut self, artifact: CredentialArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Account name used for error reports.
    pub fn report_owner(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.name)
    }
}

/// Which record family a folder belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Identities,
    Contents,
}

impl RecordKind {
    fn dir_name(self) -> &'static str {
        match self {
            RecordKind::Identities => "profiles",
            RecordKind::Contents => "comments",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            RecordKind::Identities => "profiles.json",
            RecordKind::Contents => "comments.json",
        }
    }
}

/// Persistence for identity and content records, grouped in named folders.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load_identities(&self, folder: &str) -> anyhow::Result<Vec<Identity>>;

    async fn save_identities(&self, folder: &str, identities: &[Identity]) -> anyhow::Result<()>;

    async fn load_contents(&self, folder: &str) -> anyhow::Result<Vec<String>>;

    async fn save_contents(&self, folder: &str, contents: &[String]) -> anyhow::Result<()>;

    /// Folder names for `kind`; never empty.
    async fn folders(&self, kind: RecordKind) -> anyhow::Result<Vec<String>>;
}

/// JSON-file store rooted at a directory:
/// `{root}/profiles/{folder}/profiles.json` and
/// `{root}/comments/{folder}/comments.json`.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_dir(&self, kind: RecordKind, folder: &str) -> anyhow::Result<PathBuf> {
        validate_folder_name(folder)?;
        Ok(self.root.join(kind.dir_name()).join(folder))
    }

    fn file_path(&self, kind: RecordKind, folder: &str) -> anyhow::Result<PathBuf> {
        Ok(self.folder_dir(kind, folder)?.join(kind.file_name()))
    }

    /// Create an empty folder. Fails if it already exists.
    pub async fn create_folder(&self, kind: RecordKind, folder: &str) -> anyhow::Result<()> {
        let dir = self.folder_dir(kind, folder)?;
        if tokio::fs::try_exists(&dir).await? {
            anyhow::bail!("folder '{folder}' already exists");
        }
        tokio::fs::create_dir_all(&dir).await?;
        write_json::<String>(&dir.join(kind.file_name()), &[]).await?;
        info!(folder, kind = ?kind, "folder created");
        Ok(())
    }

    /// Remove a folder and its records. The default folder is protected.
    pub async fn remove_folder(&self, kind: RecordKind, folder: &str) -> anyhow::Result<()> {
        if folder == DEFAULT_FOLDER {
            anyhow::bail!("the '{DEFAULT_FOLDER}' folder cannot be removed");
        }
        let dir = self.folder_dir(kind, folder)?;
        if !tokio::fs::try_exists(&dir).await? {
            anyhow::bail!("folder '{folder}' not found");
        }
        tokio::fs::remove_dir_all(&dir).await?;
        info!(folder, kind = ?kind, "folder removed");
        Ok(())
    }

    /// Move root-level `profiles.json` / `comments.json` from older layouts
    /// into the default folders, keeping a `.bak` copy of each original.
    pub async fn migrate_legacy(&self) -> anyhow::Result<()> {
        for kind in [RecordKind::Identities, RecordKind::Contents] {
            tokio::fs::create_dir_all(self.folder_dir(kind, DEFAULT_FOLDER)?).await?;
        }

        let legacy_identities = self.root.join(RecordKind::Identities.file_name());
        if tokio::fs::try_exists(&legacy_identities).await? {
            let identities: Vec<Identity> = read_json(&legacy_identities).await;
            if !identities.is_empty() {
                info!("migrating identities into the default folder");
                self.save_identities(DEFAULT_FOLDER, &identities).await?;
                backup(&legacy_identities).await?;
            }
        }

        let legacy_contents = self.root.join(RecordKind::Contents.file_name());
        if tokio::fs::try_exists(&legacy_contents).await? {
            let contents: Vec<String> = read_json(&legacy_contents).await;
            if !contents.is_empty() {
                info!("migrating contents into the default folder");
                self.save_contents(DEFAULT_FOLDER, &contents).await?;
                backup(&legacy_contents).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for JsonFileStore {
    async fn load_identities(&self, folder: &str) -> anyhow::Result<Vec<Identity>> {
        Ok(read_json(&self.file_path(RecordKind::Identities, folder)?).await)
    }

    async fn save_identities(&self, folder: &str, identities: &[Identity]) -> anyhow::Result<()> {
        write_json(&self.file_path(RecordKind::Identities, folder)?, identities).await
    }

    async fn load_contents(&self, folder: &str) -> anyhow::Result<Vec<String>> {
        Ok(read_json(&self.file_path(RecordKind::Contents, folder)?).await)
    }

    async fn save_contents(&self, folder: &str, contents: &[String]) -> anyhow::Result<()> {
        write_json(&self.file_path(RecordKind::Contents, folder)?, contents).await
    }

    async fn folders(&self, kind: RecordKind) -> anyhow::Result<Vec<String>> {
        let base = self.root.join(kind.dir_name());
        tokio::fs::create_dir_all(&base).await?;

        let mut folders = Vec::new();
        let mut entries = tokio::fs::read_dir(&base).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                folders.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        folders.sort();
        if folders.is_empty() {
            folders.push(DEFAULT_FOLDER.to_string());
        }
        Ok(folders)
    }
}

fn validate_folder_name(folder: &str) -> anyhow::Result<()> {
    let trimmed = folder.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
    {
        anyhow::bail!("invalid folder name: {folder:?}");
    }
    Ok(())
}

/// Missing or unreadable files load as empty.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "record file missing; treating as empty");
            return Vec::new();
        }
        Err(err) => {
            error!(path = %path.display(), "failed to read record file: {err}");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(err) => {
            error!(path = %path.display(), "failed to parse record file: {err}");
            Vec::new()
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let body = serde_json::to_vec(records)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

async fn backup(path: &Path) -> anyhow::Result<()> {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    let backup = PathBuf::from(backup);
    if tokio::fs::try_exists(&backup).await? {
        tokio::fs::remove_file(&backup).await?;
    }
    tokio::fs::rename(path, &backup).await?;
    Ok(())
}

/// Synchronized identity lookup shared by all workers.
///
/// The lock covers exactly one load-and-find, so workers never hold it while
/// running the slow state-machine steps.
#[derive(Clone)]
pub struct SharedIdentityAccessor {
    store: Arc<dyn IdentityStore>,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SharedIdentityAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIdentityAccessor").finish_non_exhaustive()
    }
}

impl SharedIdentityAccessor {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// First identity named `name` in `folder`, if any.
    pub async fn lookup(&self, folder: &str, name: &str) -> anyhow::Result<Option<Identity>> {
        let _guard = self.lock.lock().await;
        let identities = self.store.load_identities(folder).await?;
        Ok(identities.into_iter().find(|identity| identity.name == name))
    }
}
