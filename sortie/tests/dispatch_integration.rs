//! Dispatch integration tests.
//!
//! Covers partitioning across workers, per-item isolation, the commit retry
//! bound, crash containment, and worker storage teardown.

use std::sync::Arc;
use std::time::Duration;

use sortie::*;
use sortie_testkit::{
    InMemoryIdentityStore, LockedStorage, PayloadScript, RecordingReporter, ScriptedAuthority,
    ScriptedBackend, SessionCall, SessionScript, identity, quick_config, test_machine,
};
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

const TARGET: &str = "https://remote.test/item/7";

struct Harness {
    dispatcher: Dispatcher,
    backend: ScriptedBackend,
    reporter: RecordingReporter,
    lease: LeaseClient,
    _storage: tempfile::TempDir,
}

async fn harness(script: SessionScript, identities: Vec<Identity>) -> Harness {
    harness_with_reporter(script, identities, RecordingReporter::new()).await
}

async fn harness_with_reporter(
    script: SessionScript,
    identities: Vec<Identity>,
    reporter: RecordingReporter,
) -> Harness {
    harness_with(quick_config(), script, identities, reporter, None).await
}

async fn harness_with(
    config: SortieConfig,
    script: SessionScript,
    identities: Vec<Identity>,
    reporter: RecordingReporter,
    reclaimer: Option<Arc<dyn StorageReclaimer>>,
) -> Harness {
    init_tracing();
    let storage = tempfile::tempdir().expect("tempdir");
    let backend = ScriptedBackend::new(script);
    let store = InMemoryIdentityStore::new().with_identities(DEFAULT_FOLDER, identities);

    let mut builder = DispatcherBuilder::new(config)
        .with_backend(Arc::new(backend.clone()))
        .with_identity_store(Arc::new(store))
        .with_reporter(Arc::new(reporter.clone()))
        .with_storage_base(storage.path());
    if let Some(reclaimer) = reclaimer {
        builder = builder.with_storage_reclaimer(reclaimer);
    }
    let dispatcher = builder.build().expect("dispatcher builds");

    let lease = LeaseClient::with_interval(
        Arc::new(ScriptedAuthority::approving()),
        test_machine(),
        Duration::from_secs(1800),
    );
    lease
        .acquire("owner@example.com", "secret")
        .await
        .expect("lease acquired");

    Harness {
        dispatcher,
        backend,
        reporter,
        lease,
        _storage: storage,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn people(n: usize) -> Vec<Identity> {
    (0..n).map(|i| identity(&format!("user{i}"), &["ok"])).collect()
}

fn work(n: usize) -> Vec<(String, String)> {
    (0..n)
        .map(|i| (format!("user{i}"), format!("payload {i}")))
        .collect()
}

impl Harness {
    async fn submit(&self, pairs: Vec<(String, String)>, workers: usize) -> DispatchReport {
        timeout(
            Duration::from_secs(10),
            self.dispatcher
                .submit(TARGET, pairs, workers, DEFAULT_FOLDER, &self.lease),
        )
        .await
        .expect("dispatch finished in time")
        .expect("dispatch accepted")
    }

    fn storage_is_empty(&self) -> bool {
        self.backend.storages().iter().all(|path| !path.exists())
    }
}

#[tokio::test]
async fn six_items_over_three_workers() {
    let h = harness(SessionScript::default(), people(6)).await;

    let report = h.submit(work(6), 3).await;

    assert_eq!(report.batch_sizes, vec![2, 2, 2]);
    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(report.confirmed(), 6);
    assert_eq!(h.backend.opened(), 3);
    assert_eq!(h.backend.payloads_for_worker(0), ["payload 0", "payload 1"]);
    assert_eq!(h.backend.payloads_for_worker(1), ["payload 2", "payload 3"]);
    assert_eq!(h.backend.payloads_for_worker(2), ["payload 4", "payload 5"]);
    h.backend.assert_call_count_eq(&SessionCall::Close, 3);
    assert!(h.storage_is_empty());
    assert!(h.reporter.reports().is_empty());
    h.lease.release().await;
}

#[tokio::test]
async fn six_outcomes_even_when_items_fail() {
    let mut script = SessionScript::default();
    script.payloads.insert(
        "payload 1".into(),
        PayloadScript {
            acceptance: Some(false),
            ..Default::default()
        },
    );
    script.payloads.insert(
        "payload 4".into(),
        PayloadScript {
            commit_error: Some("detached".into()),
            ..Default::default()
        },
    );
    let h = harness(script, people(6)).await;

    let report = h.submit(work(6), 3).await;

    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(report.failed(), 2);
    assert_eq!(
        report.outcomes[1].reason.as_deref(),
        Some(REASON_NOT_ACCEPTED)
    );
    assert_eq!(report.outcomes[4].status, ItemStatus::Failed);
    let mut owners = h.reporter.owners();
    owners.sort();
    assert_eq!(owners, ["user1@example.com", "user4@example.com"]);
    h.lease.release().await;
}

#[tokio::test]
async fn rejected_artifacts_fail_only_that_item() {
    let identities = vec![
        identity("user0", &["ok"]),
        identity("user1", &["expired", "expired"]),
        identity("user2", &["ok"]),
    ];
    let mut script = SessionScript::default();
    script.rejected_artifact_values.insert("expired".into());
    let h = harness(script, identities).await;

    let report = h.submit(work(3), 1).await;

    assert_eq!(report.batch_sizes, vec![3]);
    assert!(report.outcomes[0].is_confirmed());
    assert_eq!(report.outcomes[1].reason.as_deref(), Some(REASON_NO_ARTIFACTS));
    assert!(report.outcomes[2].is_confirmed());
    assert!(report.worker_failures.is_empty());
    assert_eq!(h.backend.payloads_for_worker(0), ["payload 0", "payload 2"]);
    h.lease.release().await;
}

#[tokio::test]
async fn intercepted_commit_retries_then_forces_once() {
    let mut script = SessionScript::default();
    script.payloads.insert(
        "payload 0".into(),
        PayloadScript {
            intercept_commits: true,
            force_commit_fails: true,
            ..Default::default()
        },
    );
    let h = harness(script, people(2)).await;

    let report = h.submit(work(2), 1).await;

    h.backend
        .assert_call_count_eq(&SessionCall::Commit("payload 0".into()), 3);
    h.backend
        .assert_call_count_eq(&SessionCall::ForceCommit("payload 0".into()), 1);
    assert_eq!(report.outcomes[0].status, ItemStatus::Failed);
    assert!(report.outcomes[1].is_confirmed());
    h.backend
        .assert_call_count_eq(&SessionCall::ForceCommit("payload 1".into()), 0);
    h.lease.release().await;
}

#[tokio::test]
async fn missing_target_and_identity_are_item_failures() {
    let script = SessionScript {
        target_missing: true,
        ..Default::default()
    };
    let h = harness(script, people(1)).await;

    let pairs = vec![
        ("user0".to_string(), "a".to_string()),
        ("ghost".to_string(), "b".to_string()),
    ];
    let report = h.submit(pairs, 2).await;

    assert_eq!(report.outcomes[0].reason.as_deref(), Some(REASON_TARGET_NOT_FOUND));
    assert_eq!(report.outcomes[1].reason.as_deref(), Some(REASON_IDENTITY_NOT_FOUND));
    assert!(report.worker_failures.is_empty());
    h.lease.release().await;
}

#[tokio::test]
async fn crashed_worker_does_not_stop_siblings() {
    let mut script = SessionScript::default();
    script.payloads.insert(
        "payload 2".into(),
        PayloadScript {
            panic: true,
            ..Default::default()
        },
    );
    let h = harness(script, people(6)).await;

    let report = h.submit(work(6), 3).await;

    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(report.worker_failures.len(), 1);
    assert_eq!(report.worker_failures[0].worker_index, 1);
    assert!(!report.outcomes[2].is_confirmed());
    assert!(!report.outcomes[3].is_confirmed());
    for i in [0, 1, 4, 5] {
        assert!(report.outcomes[i].is_confirmed(), "item {i} should confirm");
    }
    assert!(h.storage_is_empty());
    h.lease.release().await;
}

#[tokio::test]
async fn session_open_failure_fails_whole_batch() {
    let script = SessionScript {
        fail_open: true,
        ..Default::default()
    };
    let h = harness(script, people(4)).await;

    let report = h.submit(work(4), 2).await;

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.failed(), 4);
    assert_eq!(report.worker_failures.len(), 2);
    assert!(report.worker_failures[0].reason.contains("could not open session"));
    assert_eq!(h.reporter.reports().len(), 4);
    h.lease.release().await;
}

#[tokio::test]
async fn restrictive_storage_is_still_reclaimed() {
    let script = SessionScript {
        litter_storage: true,
        ..Default::default()
    };
    let h = harness(script, people(4)).await;

    let report = h.submit(work(4), 2).await;

    assert_eq!(report.confirmed(), 4);
    assert!(report.teardown_failures.is_empty());
    assert!(h.storage_is_empty());
    h.lease.release().await;
}

#[tokio::test]
async fn locked_storage_is_left_behind_without_failing_items() {
    let locked = LockedStorage::new();
    let h = harness_with(
        quick_config(),
        SessionScript::default(),
        people(2),
        RecordingReporter::new(),
        Some(Arc::new(locked.clone())),
    )
    .await;

    let report = h.submit(work(2), 1).await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.confirmed(), 2);
    assert!(report.worker_failures.is_empty());
    assert_eq!(report.teardown_failures.len(), 1);
    let TeardownError::Exhausted { path, attempts, last_error } = &report.teardown_failures[0];
    assert_eq!(*attempts, 3);
    assert!(last_error.contains("locked"));
    assert_eq!(locked.attempts(), 3);
    assert_eq!(locked.attempts_on(path), 3);
    assert!(path.exists());
    assert!(h.reporter.reports().is_empty());
    h.lease.release().await;
}

#[tokio::test]
async fn abandoned_dispatch_still_reclaims_storage() {
    let mut config = quick_config();
    config.session.settle_after_commit_ms = 300;
    let h = harness_with(
        config,
        SessionScript::default(),
        people(2),
        RecordingReporter::new(),
        None,
    )
    .await;

    let abandoned = timeout(
        Duration::from_millis(150),
        h.dispatcher
            .submit(TARGET, work(2), 1, DEFAULT_FOLDER, &h.lease),
    )
    .await;
    assert!(abandoned.is_err(), "dispatch should still be running");
    assert_eq!(h.backend.opened(), 1);

    timeout(Duration::from_secs(5), async {
        while h.backend.count(&SessionCall::Close) == 0 || !h.storage_is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("worker finished its batch and reclaimed its storage");

    assert_eq!(h.backend.payloads_for_worker(0), ["payload 0", "payload 1"]);
    h.lease.release().await;
}

#[tokio::test]
async fn collector_outage_is_swallowed() {
    let mut script = SessionScript::default();
    script.payloads.insert(
        "payload 0".into(),
        PayloadScript {
            acceptance: Some(false),
            ..Default::default()
        },
    );
    let h = harness_with_reporter(script, people(2), RecordingReporter::failing()).await;

    let report = h.submit(work(2), 2).await;

    assert_eq!(report.failed(), 1);
    assert_eq!(h.reporter.reports().len(), 1);
    h.lease.release().await;
}

#[tokio::test]
async fn more_workers_than_items() {
    let h = harness(SessionScript::default(), people(2)).await;

    let report = h.submit(work(2), 5).await;

    assert_eq!(report.batch_sizes, vec![1, 1]);
    assert_eq!(h.backend.opened(), 2);
    assert_eq!(report.confirmed(), 2);
    h.lease.release().await;
}

#[tokio::test]
async fn invalid_lease_launches_nothing() {
    let h = harness(SessionScript::default(), people(2)).await;
    h.lease.release().await;

    let err = h
        .dispatcher
        .submit(TARGET, work(2), 2, DEFAULT_FOLDER, &h.lease)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::LeaseInvalid));
    assert_eq!(h.backend.opened(), 0);
}
