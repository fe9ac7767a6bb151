use async_trait::async_trait;
use parking_lot::Mutex;
use sortie::*;
use std::collections::VecDeque;
use std::sync::Arc;

/// Error reporter that records every report it receives.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<(String, String)>>>,
    fail: bool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reporter whose collector is down: reports are recorded, then rejected.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().clone()
    }

    pub fn owners(&self) -> Vec<String> {
        self.reports.lock().iter().map(|(o, _)| o.clone()).collect()
    }
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report(&self, owner: &str, message: &str) -> anyhow::Result<()> {
        self.reports
            .lock()
            .push((owner.to_string(), message.to_string()));
        if self.fail {
            anyhow::bail!("collector unavailable");
        }
        Ok(())
    }
}

/// License authority that replays scripted verdicts, then approves.
#[derive(Clone, Default)]
pub struct ScriptedAuthority {
    verdicts: Arc<Mutex<VecDeque<Result<(), LeaseError>>>>,
    verify_calls: Arc<Mutex<usize>>,
    release_calls: Arc<Mutex<usize>>,
    fail_release: bool,
}

impl ScriptedAuthority {
    pub fn approving() -> Self {
        Self::default()
    }

    pub fn with_verdicts(verdicts: Vec<Result<(), LeaseError>>) -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(verdicts.into())),
            ..Default::default()
        }
    }

    /// Authority that reports the lease held elsewhere since `last_access`.
    pub fn conflicting(last_access: &str) -> Self {
        Self::with_verdicts(vec![Err(LeaseError::Conflict {
            reason: "license já está em uso em outra máquina".into(),
            last_access: Some(last_access.to_string()),
        })])
    }

    pub fn with_failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn push_verdict(&self, verdict: Result<(), LeaseError>) {
        self.verdicts.lock().push_back(verdict);
    }

    pub fn verify_calls(&self) -> usize {
        *self.verify_calls.lock()
    }

    pub fn release_calls(&self) -> usize {
        *self.release_calls.lock()
    }
}

#[async_trait]
impl LicenseAuthority for ScriptedAuthority {
    async fn verify(
        &self,
        _owner: &str,
        _credential: &str,
        _machine: &MachineIdentity,
    ) -> Result<(), LeaseError> {
        *self.verify_calls.lock() += 1;
        self.verdicts.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn release(&self, _owner: &str, _machine: &MachineIdentity) -> anyhow::Result<()> {
        *self.release_calls.lock() += 1;
        if self.fail_release {
            anyhow::bail!("authority unreachable");
        }
        Ok(())
    }
}
