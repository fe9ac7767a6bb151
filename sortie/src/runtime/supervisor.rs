use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::DispatchConfig;
use crate::error::{DispatchError, TeardownError, ValidationError};
use crate::lease::LeaseClient;
use crate::partition::{self, WorkItem};
use crate::reporter;

use super::worker::{OutcomeRecord, OutcomeSlots, SessionWorker, WorkerDeps, WorkerExit};

/// A worker that stopped before finishing its batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub worker_index: usize,
    pub reason: String,
}

/// Aggregate result of one dispatch.
#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    /// Exactly one record per submitted item, in submission order.
    pub outcomes: Vec<OutcomeRecord>,
    /// Size of each batch, by worker index.
    pub batch_sizes: Vec<usize>,
    pub worker_failures: Vec<WorkerFailure>,
    /// Worker storage left behind. Never affects item outcomes.
    pub teardown_failures: Vec<TeardownError>,
}

impl DispatchReport {
    pub fn confirmed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_confirmed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.confirmed()
    }
}

/// Lease-gated entrypoint that fans work out over isolated session workers.
pub struct Dispatcher {
    config: DispatchConfig,
    deps: WorkerDeps,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("session", &self.deps.session)
            .field("reaper", &self.deps.reaper)
            .field("storage_base", &self.deps.storage_base)
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(config: DispatchConfig, deps: WorkerDeps) -> Self {
        Self { config, deps }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Pair identities with payloads positionally and dispatch them.
    ///
    /// # Errors
    ///
    /// [`ValidationError::CountMismatch`] when the lists differ in length, plus
    /// everything [`Dispatcher::submit`] returns.
    pub async fn submit_lists(
        &self,
        target: &str,
        identities: Vec<String>,
        payloads: Vec<String>,
        worker_count: usize,
        folder: &str,
        lease: &LeaseClient,
    ) -> Result<DispatchReport, DispatchError> {
        if identities.len() != payloads.len() {
            return Err(ValidationError::CountMismatch {
                identities: identities.len(),
                payloads: payloads.len(),
            }
            .into());
        }
        let pairs = identities.into_iter().zip(payloads).collect();
        self.submit(target, pairs, worker_count, folder, lease).await
    }

    /// Run every `(identity, payload)` pair against `target` and wait for all
    /// workers to finish.
    ///
    /// Fails only before launch: on a malformed request or when the cached
    /// lease is not valid. Everything that goes wrong after launch is reported
    /// in the returned [`DispatchReport`].
    pub async fn submit(
        &self,
        target: &str,
        pairs: Vec<(String, String)>,
        worker_count: usize,
        folder: &str,
        lease: &LeaseClient,
    ) -> Result<DispatchReport, DispatchError> {
        if target.trim().is_empty() {
            return Err(ValidationError::EmptyTarget.into());
        }
        if worker_count == 0 {
            return Err(ValidationError::ZeroWorkers.into());
        }
        if !lease.is_valid() {
            warn!("dispatch refused: lease is not valid");
            return Err(DispatchError::LeaseInvalid);
        }

        let items: Vec<WorkItem> = pairs
            .into_iter()
            .map(|(identity, payload)| WorkItem::new(identity, payload, target))
            .collect();
        let identities: Vec<String> = items.iter().map(|item| item.identity.clone()).collect();
        let total = items.len();

        let batches = partition::divide(items, worker_count);
        let pool_size = worker_count.min(self.config.max_pool_size.max(1));
        info!(
            items = total,
            workers = batches.len(),
            pool_size,
            folder,
            "dispatch started"
        );

        let slots: OutcomeSlots = Arc::new(Mutex::new(vec![None; total]));
        let permits = Arc::new(Semaphore::new(pool_size));
        let folder: Arc<str> = Arc::from(folder);
        let mut batch_sizes = Vec::with_capacity(batches.len());
        let mut workers = Vec::with_capacity(batches.len());

        // Detached: dropping this future leaves every worker running through
        // its own teardown.
        for batch in batches {
            let worker_index = batch.worker_index;
            let range = batch.offset..batch.offset + batch.len();
            batch_sizes.push(batch.len());

            let worker = SessionWorker::new(worker_index, folder.clone(), self.deps.clone());
            let slots = slots.clone();
            let permits = permits.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                worker.run(batch, slots).await
            });
            workers.push((worker_index, range, handle));
        }

        let mut report = DispatchReport {
            batch_sizes,
            ..Default::default()
        };

        for (worker_index, range, handle) in workers {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(join) => {
                    error!(worker = worker_index, "worker task aborted: {join}");
                    WorkerExit {
                        worker_index,
                        crash: Some(format!("worker task aborted: {join}")),
                        teardown: None,
                    }
                }
            };

            if let Some(err) = exit.teardown {
                report.teardown_failures.push(err);
            }
            if let Some(reason) = exit.crash {
                self.fail_unprocessed(&slots, &identities, range, &reason).await;
                report.worker_failures.push(WorkerFailure {
                    worker_index: exit.worker_index,
                    reason,
                });
            }
        }

        let filled = std::mem::take(&mut *slots.lock());
        report.outcomes = filled
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    OutcomeRecord::failed(index, &identities[index], "no outcome recorded")
                })
            })
            .collect();
        report.worker_failures.sort_by_key(|f| f.worker_index);

        info!(
            confirmed = report.confirmed(),
            failed = report.failed(),
            worker_failures = report.worker_failures.len(),
            teardown_failures = report.teardown_failures.len(),
            "dispatch finished"
        );
        Ok(report)
    }

    /// Record `FAILED` for every item in `range` the worker never reached.
    async fn fail_unprocessed(
        &self,
        slots: &OutcomeSlots,
        identities: &[String],
        range: std::ops::Range<usize>,
        reason: &str,
    ) {
        let missing: Vec<usize> = {
            let guard = slots.lock();
            range.filter(|&index| guard[index].is_none()).collect()
        };
        for index in missing {
            let identity = &identities[index];
            let message = format!("worker stopped before this item ran: {reason}");
            reporter::report_best_effort(self.deps.reporter.as_ref(), identity, &message).await;
            slots.lock()[index] = Some(OutcomeRecord::failed(index, identity, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LicenseAuthority;
    use crate::config::{ReaperConfig, SessionConfig};
    use crate::error::{CommitError, LeaseError, StepError};
    use crate::identity::{
        CredentialArtifact, Identity, IdentityStore, RecordKind, SharedIdentityAccessor,
    };
    use crate::machine::MachineIdentity;
    use crate::reaper::WorkerContext;
    use crate::reporter::NoopReporter;
    use crate::session::{RemoteSession, SessionBackend};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Approving;

    #[async_trait]
    impl LicenseAuthority for Approving {
        async fn verify(&self, _o: &str, _c: &str, _m: &MachineIdentity) -> Result<(), LeaseError> {
            Ok(())
        }
        async fn release(&self, _o: &str, _m: &MachineIdentity) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Everyone;

    #[async_trait]
    impl IdentityStore for Everyone {
        async fn load_identities(&self, _folder: &str) -> anyhow::Result<Vec<Identity>> {
            Ok(["a", "b", "c", "d", "e"].map(Identity::new).to_vec())
        }
        async fn save_identities(&self, _f: &str, _i: &[Identity]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load_contents(&self, _f: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn save_contents(&self, _f: &str, _c: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn folders(&self, _k: RecordKind) -> anyhow::Result<Vec<String>> {
            Ok(vec!["default".into()])
        }
    }

    struct Obliging;

    #[async_trait]
    impl RemoteSession for Obliging {
        async fn navigate(&mut self, _url: &str) -> Result<(), StepError> {
            Ok(())
        }
        async fn inject_artifact(&mut self, _a: &CredentialArtifact) -> Result<(), StepError> {
            Ok(())
        }
        async fn locate_target(&mut self) -> Result<bool, StepError> {
            Ok(true)
        }
        async fn set_payload(&mut self, payload: &str) -> Result<(), StepError> {
            if payload == "explode" {
                panic!("payload handler crashed");
            }
            Ok(())
        }
        async fn commit(&mut self) -> Result<(), CommitError> {
            Ok(())
        }
        async fn force_commit(&mut self) -> Result<(), CommitError> {
            Ok(())
        }
        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct ObligingBackend;

    #[async_trait]
    impl SessionBackend for ObligingBackend {
        async fn open(
            &self,
            _context: &WorkerContext,
            _flags: &[String],
        ) -> anyhow::Result<Box<dyn RemoteSession>> {
            Ok(Box::new(Obliging))
        }
    }

    fn dispatcher(storage: &std::path::Path) -> Dispatcher {
        let deps = WorkerDeps {
            backend: Arc::new(ObligingBackend),
            accessor: SharedIdentityAccessor::new(Arc::new(Everyone)),
            reporter: Arc::new(NoopReporter),
            session: Arc::new(SessionConfig::immediate()),
            reaper: ReaperConfig {
                grace_ms: 0,
                max_attempts: 3,
                backoff_ms: 1,
            },
            reclaimer: Arc::new(crate::reaper::remove_tree),
            storage_base: Some(storage.to_path_buf()),
        };
        Dispatcher::new(DispatchConfig::default(), deps)
    }

    fn lease() -> LeaseClient {
        LeaseClient::with_interval(
            Arc::new(Approving),
            MachineIdentity::from_raw("machine-test"),
            Duration::from_secs(1800),
        )
    }

    fn pairs(names: &[&str]) -> Vec<(String, String)> {
        names
            .iter()
            .map(|name| (name.to_string(), format!("hi from {name}")))
            .collect()
    }

    #[tokio::test]
    async fn refuses_without_valid_lease() {
        let dir = tempfile::tempdir().unwrap();
        let err = dispatcher(dir.path())
            .submit("https://t", pairs(&["a"]), 1, "default", &lease())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::LeaseInvalid));
    }

    #[tokio::test]
    async fn validation_runs_before_lease_gate() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        let lease = lease();

        let err = d
            .submit_lists("https://t", vec!["a".into()], vec![], 1, "default", &lease)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Validation(ValidationError::CountMismatch { identities: 1, payloads: 0 })
        ));

        let err = d.submit("https://t", pairs(&["a"]), 0, "default", &lease).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(ValidationError::ZeroWorkers)));

        let err = d.submit("  ", pairs(&["a"]), 1, "default", &lease).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(ValidationError::EmptyTarget)));
    }

    #[tokio::test]
    async fn empty_request_yields_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let lease = lease();
        lease.acquire("owner@example.com", "secret").await.unwrap();

        let report = dispatcher(dir.path())
            .submit("https://t", Vec::new(), 3, "default", &lease)
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert!(report.batch_sizes.is_empty());
        lease.release().await;
    }

    #[tokio::test]
    async fn outcomes_follow_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let lease = lease();
        lease.acquire("owner@example.com", "secret").await.unwrap();

        let report = dispatcher(dir.path())
            .submit("https://t", pairs(&["a", "b", "c", "d", "e"]), 2, "default", &lease)
            .await
            .unwrap();
        assert_eq!(report.batch_sizes, vec![2, 3]);
        assert_eq!(report.confirmed(), 5);
        let names: Vec<_> = report.outcomes.iter().map(|o| o.identity.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d", "e"]);
        assert!(report.teardown_failures.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        lease.release().await;
    }

    #[tokio::test]
    async fn panicking_worker_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let lease = lease();
        lease.acquire("owner@example.com", "secret").await.unwrap();

        let work = vec![
            ("a".to_string(), "explode".to_string()),
            ("b".to_string(), "fine".to_string()),
            ("c".to_string(), "fine".to_string()),
            ("d".to_string(), "fine".to_string()),
        ];
        let report = dispatcher(dir.path())
            .submit("https://t", work, 2, "default", &lease)
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.worker_failures.len(), 1);
        assert_eq!(report.worker_failures[0].worker_index, 0);
        assert!(!report.outcomes[0].is_confirmed());
        assert!(!report.outcomes[1].is_confirmed());
        assert!(report.outcomes[2].is_confirmed());
        assert!(report.outcomes[3].is_confirmed());
        // storage of the crashed worker is still reclaimed
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        lease.release().await;
    }
}
