use async_trait::async_trait;
use parking_lot::Mutex;
use sortie::*;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// How the scripted session treats one payload.
#[derive(Clone, Debug, Default)]
pub struct PayloadScript {
    /// Every ordinary commit is intercepted.
    pub intercept_commits: bool,
    /// Ordinary commits fail with a non-retryable error.
    pub commit_error: Option<String>,
    pub force_commit_fails: bool,
    pub acceptance: Option<bool>,
    /// Panic inside `set_payload`, simulating a crashed worker.
    pub panic: bool,
}

/// Backend behavior shared by every session it opens.
#[derive(Clone, Debug, Default)]
pub struct SessionScript {
    pub fail_open: bool,
    /// The target never appears.
    pub target_missing: bool,
    /// Artifacts with these values are rejected.
    pub rejected_artifact_values: HashSet<String>,
    pub payloads: HashMap<String, PayloadScript>,
    /// Write a nested, read-only tree into the worker storage on open.
    pub litter_storage: bool,
}

/// One recorded session call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCall {
    Navigate(String),
    Inject(String),
    Locate,
    SetPayload(String),
    Commit(String),
    ForceCommit(String),
    Close,
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub worker_index: usize,
    pub call: SessionCall,
}

/// Backend that opens [`ScriptedSession`]s and records every call they see.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<SessionScript>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    storages: Arc<Mutex<Vec<PathBuf>>>,
}

impl ScriptedBackend {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script: Arc::new(script),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Storage directories handed to `open`, in open order.
    pub fn storages(&self) -> Vec<PathBuf> {
        self.storages.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.storages.lock().len()
    }

    pub fn count(&self, call: &SessionCall) -> usize {
        self.calls.lock().iter().filter(|r| &r.call == call).count()
    }

    /// Payloads set by one worker, in the order it set them.
    pub fn payloads_for_worker(&self, worker_index: usize) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.worker_index == worker_index)
            .filter_map(|r| match &r.call {
                SessionCall::SetPayload(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn assert_call_count_eq(&self, call: &SessionCall, expected: usize) {
        let actual = self.count(call);
        assert_eq!(
            actual, expected,
            "Expected {} calls of {:?}, got {}",
            expected, call, actual
        );
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn open(
        &self,
        context: &WorkerContext,
        _throttling_flags: &[String],
    ) -> anyhow::Result<Box<dyn RemoteSession>> {
        if self.script.fail_open {
            anyhow::bail!("scripted open failure");
        }
        self.storages.lock().push(context.storage().to_path_buf());

        if self.script.litter_storage {
            litter(context.storage())?;
        }

        Ok(Box::new(ScriptedSession {
            worker_index: context.worker_index(),
            script: self.script.clone(),
            calls: self.calls.clone(),
            payload: None,
        }))
    }
}

fn litter(storage: &std::path::Path) -> std::io::Result<()> {
    let nested = storage.join("profile/cache");
    std::fs::create_dir_all(&nested)?;
    std::fs::write(nested.join("lock"), b"held")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(nested.join("lock"), std::fs::Permissions::from_mode(0o400))?;
        std::fs::set_permissions(&nested, std::fs::Permissions::from_mode(0o500))?;
    }
    Ok(())
}

/// Session that follows a [`SessionScript`].
pub struct ScriptedSession {
    worker_index: usize,
    script: Arc<SessionScript>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    payload: Option<String>,
}

impl ScriptedSession {
    fn record(&self, call: SessionCall) {
        self.calls.lock().push(CallRecord {
            worker_index: self.worker_index,
            call,
        });
    }

    fn current(&self) -> PayloadScript {
        self.payload
            .as_ref()
            .and_then(|p| self.script.payloads.get(p))
            .cloned()
            .unwrap_or_default()
    }

    fn payload_name(&self) -> String {
        self.payload.clone().unwrap_or_default()
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), StepError> {
        self.record(SessionCall::Navigate(url.to_string()));
        Ok(())
    }

    async fn inject_artifact(&mut self, artifact: &CredentialArtifact) -> Result<(), StepError> {
        self.record(SessionCall::Inject(artifact.name.clone()));
        if self.script.rejected_artifact_values.contains(&artifact.value) {
            return Err(StepError::Transient(format!(
                "artifact '{}' rejected",
                artifact.name
            )));
        }
        Ok(())
    }

    async fn locate_target(&mut self) -> Result<bool, StepError> {
        self.record(SessionCall::Locate);
        Ok(!self.script.target_missing)
    }

    async fn set_payload(&mut self, payload: &str) -> Result<(), StepError> {
        self.payload = Some(payload.to_string());
        self.record(SessionCall::SetPayload(payload.to_string()));
        if self.current().panic {
            panic!("scripted panic while setting payload");
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), CommitError> {
        self.record(SessionCall::Commit(self.payload_name()));
        let script = self.current();
        if let Some(error) = script.commit_error {
            return Err(CommitError::Other(error));
        }
        if script.intercept_commits {
            return Err(CommitError::Intercepted("element click intercepted".into()));
        }
        Ok(())
    }

    async fn force_commit(&mut self) -> Result<(), CommitError> {
        self.record(SessionCall::ForceCommit(self.payload_name()));
        if self.current().force_commit_fails {
            return Err(CommitError::Other("forced click rejected".into()));
        }
        Ok(())
    }

    async fn acceptance(&mut self) -> Option<bool> {
        self.current().acceptance
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.record(SessionCall::Close);
        Ok(())
    }
}
