use async_trait::async_trait;
use parking_lot::Mutex;
use sortie::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity/content store held in memory, keyed by folder.
#[derive(Clone, Default)]
pub struct InMemoryIdentityStore {
    identities: Arc<Mutex<HashMap<String, Vec<Identity>>>>,
    contents: Arc<Mutex<HashMap<String, Vec<String>>>>,
    loads: Arc<Mutex<usize>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(self, folder: &str, identities: Vec<Identity>) -> Self {
        self.identities.lock().insert(folder.to_string(), identities);
        self
    }

    /// Number of identity loads served so far.
    pub fn loads(&self) -> usize {
        *self.loads.lock()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn load_identities(&self, folder: &str) -> anyhow::Result<Vec<Identity>> {
        *self.loads.lock() += 1;
        Ok(self
            .identities
            .lock()
            .get(folder)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_identities(&self, folder: &str, identities: &[Identity]) -> anyhow::Result<()> {
        self.identities
            .lock()
            .insert(folder.to_string(), identities.to_vec());
        Ok(())
    }

    async fn load_contents(&self, folder: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.contents.lock().get(folder).cloned().unwrap_or_default())
    }

    async fn save_contents(&self, folder: &str, contents: &[String]) -> anyhow::Result<()> {
        self.contents
            .lock()
            .insert(folder.to_string(), contents.to_vec());
        Ok(())
    }

    async fn folders(&self, kind: RecordKind) -> anyhow::Result<Vec<String>> {
        let mut folders: Vec<String> = match kind {
            RecordKind::Identities => self.identities.lock().keys().cloned().collect(),
            RecordKind::Contents => self.contents.lock().keys().cloned().collect(),
        };
        folders.sort();
        if folders.is_empty() {
            folders.push(DEFAULT_FOLDER.to_string());
        }
        Ok(folders)
    }
}
