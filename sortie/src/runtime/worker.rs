use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::{ReaperConfig, SessionConfig};
use crate::error::{CommitError, StepError, TeardownError};
use crate::identity::{Identity, SharedIdentityAccessor};
use crate::partition::{Batch, WorkItem};
use crate::reaper::{self, StorageReclaimer, WorkerContext};
use crate::reporter::{self, ErrorReporter};
use crate::session::{RemoteSession, SessionBackend};
use crate::telemetry;

pub const REASON_IDENTITY_NOT_FOUND: &str = "identity not found";
pub const REASON_TARGET_NOT_FOUND: &str = "target not found";
pub const REASON_NOT_ACCEPTED: &str = "submission not accepted";
pub const REASON_NO_ARTIFACTS: &str = "no credential artifact could be injected";

/// Per-item state machine. `Confirmed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Init,
    ContextReady,
    Authenticated,
    Navigated,
    TargetLocated,
    Submitted,
    Confirmed,
    Failed,
}

impl ItemState {
    /// Successor on [`StepOutcome::Advance`].
    pub fn next(self) -> ItemState {
        match self {
            ItemState::Init => ItemState::ContextReady,
            ItemState::ContextReady => ItemState::Authenticated,
            ItemState::Authenticated => ItemState::Navigated,
            ItemState::Navigated => ItemState::TargetLocated,
            ItemState::TargetLocated => ItemState::Submitted,
            ItemState::Submitted => ItemState::Confirmed,
            ItemState::Confirmed => ItemState::Confirmed,
            ItemState::Failed => ItemState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Confirmed | ItemState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Init => "INIT",
            ItemState::ContextReady => "CONTEXT_READY",
            ItemState::Authenticated => "AUTHENTICATED",
            ItemState::Navigated => "NAVIGATED",
            ItemState::TargetLocated => "TARGET_LOCATED",
            ItemState::Submitted => "SUBMITTED",
            ItemState::Confirmed => "CONFIRMED",
            ItemState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Move to the next state.
    Advance,
    /// Run the same transition again after the given pause.
    Retry { after: Duration },
    /// Terminate the item with a reason.
    Fail(String),
}

/// Terminal status of a work item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Confirmed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Confirmed => "confirmed",
            ItemStatus::Failed => "failed",
        }
    }
}

/// Result for one input item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Position of the item in the submitted list.
    pub index: usize,
    pub identity: String,
    pub status: ItemStatus,
    pub reason: Option<String>,
}

impl OutcomeRecord {
    pub fn confirmed(index: usize, identity: impl Into<String>) -> Self {
        Self {
            index,
            identity: identity.into(),
            status: ItemStatus::Confirmed,
            reason: None,
        }
    }

    pub fn failed(index: usize, identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            index,
            identity: identity.into(),
            status: ItemStatus::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == ItemStatus::Confirmed
    }
}

/// Outcome slots indexed by input position, filled as items finish.
pub(crate) type OutcomeSlots = Arc<Mutex<Vec<Option<OutcomeRecord>>>>;

/// Collaborators and budgets shared by every worker of a dispatch.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub(crate) backend: Arc<dyn SessionBackend>,
    pub(crate) accessor: SharedIdentityAccessor,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) session: Arc<SessionConfig>,
    pub(crate) reaper: ReaperConfig,
    pub(crate) reclaimer: Arc<dyn StorageReclaimer>,
    pub(crate) storage_base: Option<PathBuf>,
}

/// How a worker ended.
#[derive(Debug)]
pub(crate) struct WorkerExit {
    pub(crate) worker_index: usize,
    /// Set when the worker stopped before finishing its batch.
    pub(crate) crash: Option<String>,
    pub(crate) teardown: Option<TeardownError>,
}

/// Owns one isolated context and runs its batch's items in order.
pub(crate) struct SessionWorker {
    worker_index: usize,
    folder: Arc<str>,
    deps: WorkerDeps,
}

impl SessionWorker {
    pub(crate) fn new(worker_index: usize, folder: Arc<str>, deps: WorkerDeps) -> Self {
        Self {
            worker_index,
            folder,
            deps,
        }
    }

    /// Run the whole batch. Storage is torn down on every path out, including
    /// a panic inside the item loop.
    pub(crate) async fn run(self, batch: Batch<WorkItem>, slots: OutcomeSlots) -> WorkerExit {
        let worker_index = self.worker_index;
        let span = telemetry::worker_span(worker_index, batch.len());
        async move {
            self.stagger().await;

            let context = match self.allocate_context().await {
                Ok(context) => context,
                Err(err) => {
                    error!("could not allocate worker storage: {err}");
                    return WorkerExit {
                        worker_index,
                        crash: Some(format!("could not allocate worker storage: {err}")),
                        teardown: None,
                    };
                }
            };

            let reaper_config = self.deps.reaper.clone();
            let reclaimer = self.deps.reclaimer.clone();
            let opened = self
                .deps
                .backend
                .open(&context, &self.deps.session.throttling_flags)
                .await;
            let crash = match opened {
                Ok(session) => {
                    info!(storage = %context.storage().display(), "session opened");
                    let handle = tokio::spawn(self.drive(batch, session, slots).in_current_span());
                    match handle.await {
                        Ok(()) => None,
                        Err(join) => Some(describe_join_error(join)),
                    }
                }
                Err(err) => Some(format!("could not open session: {err:#}")),
            };

            if let Some(reason) = &crash {
                error!("worker stopped early: {reason}");
            }

            let teardown = reaper::teardown_using(context, &reaper_config, reclaimer)
                .await
                .err();
            WorkerExit {
                worker_index,
                crash,
                teardown,
            }
        }
        .instrument(span)
        .await
    }

    async fn stagger(&self) {
        let config = &self.deps.session;
        let base = config.stagger_per_worker_ms * self.worker_index as u64;
        let jitter = if config.stagger_jitter_ms > 0 {
            rand::rng().random_range(0..=config.stagger_jitter_ms)
        } else {
            0
        };
        let delay = Duration::from_millis(base + jitter);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "staggering worker start");
            tokio::time::sleep(delay).await;
        }
    }

    async fn allocate_context(&self) -> std::io::Result<WorkerContext> {
        let index = self.worker_index;
        let base = self.deps.storage_base.clone();
        tokio::task::spawn_blocking(move || match base {
            Some(base) => WorkerContext::allocate_in(&base, index),
            None => WorkerContext::allocate(index),
        })
        .await
        .unwrap_or_else(|join| Err(std::io::Error::other(join.to_string())))
    }

    async fn drive(self, batch: Batch<WorkItem>, mut session: Box<dyn RemoteSession>, slots: OutcomeSlots) {
        let offset = batch.offset;
        for (position, item) in batch.items.iter().enumerate() {
            let index = offset + position;
            let span = telemetry::item_span(self.worker_index, index, &item.identity);
            let record = self
                .process_item(session.as_mut(), index, item)
                .instrument(span)
                .await;
            slots.lock()[index] = Some(record);
        }

        if let Err(err) = session.close().await {
            warn!("failed to close session: {err:#}");
        }
    }

    /// Drive one item from `INIT` to a terminal state.
    pub(crate) async fn process_item(
        &self,
        session: &mut dyn RemoteSession,
        index: usize,
        item: &WorkItem,
    ) -> OutcomeRecord {
        let timer = telemetry::start_item_timer();
        let mut run = ItemRun {
            config: &self.deps.session,
            reporter: self.deps.reporter.as_ref(),
            session,
            item,
            identity: None,
            locate_deadline: None,
            payload_set: false,
            commit_attempts: 0,
        };

        let mut state = ItemState::Init;
        let mut failure = None;
        while !state.is_terminal() {
            let outcome = if state == ItemState::Init {
                self.resolve_identity(&mut run).await
            } else {
                run.step(state).await
            };
            match outcome {
                StepOutcome::Advance => {
                    state = state.next();
                    debug!(state = %state, "advanced");
                }
                StepOutcome::Retry { after } => {
                    if !after.is_zero() {
                        tokio::time::sleep(after).await;
                    }
                }
                StepOutcome::Fail(reason) => {
                    warn!(state = %state, "item failed: {reason}");
                    failure = Some(reason);
                    state = ItemState::Failed;
                }
            }
        }

        let record = match failure {
            None => OutcomeRecord::confirmed(index, &item.identity),
            Some(reason) => {
                let owner = run
                    .identity
                    .as_ref()
                    .map_or(item.identity.as_str(), Identity::report_owner);
                let message = format!("{reason} (target: {})", item.target);
                reporter::report_best_effort(run.reporter, owner, &message).await;
                OutcomeRecord::failed(index, &item.identity, reason)
            }
        };
        telemetry::record_item_outcome(&item.identity, record.status.as_str(), timer.elapsed());
        record
    }

    /// `INIT -> CONTEXT_READY`: the worker context already exists, so this
    /// step only resolves the identity record under the shared lock.
    async fn resolve_identity(&self, run: &mut ItemRun<'_>) -> StepOutcome {
        match self.deps.accessor.lookup(&self.folder, &run.item.identity).await {
            Ok(Some(identity)) => {
                run.identity = Some(identity);
                StepOutcome::Advance
            }
            Ok(None) => StepOutcome::Fail(REASON_IDENTITY_NOT_FOUND.to_string()),
            Err(err) => StepOutcome::Fail(format!("identity lookup failed: {err:#}")),
        }
    }
}

/// Mutable state for one item's pass through the machine.
struct ItemRun<'a> {
    config: &'a SessionConfig,
    reporter: &'a dyn ErrorReporter,
    session: &'a mut dyn RemoteSession,
    item: &'a WorkItem,
    identity: Option<Identity>,
    locate_deadline: Option<Instant>,
    payload_set: bool,
    commit_attempts: u32,
}

impl ItemRun<'_> {
    /// Run the transition out of `state`.
    async fn step(&mut self, state: ItemState) -> StepOutcome {
        match state {
            ItemState::ContextReady => self.authenticate().await,
            ItemState::Authenticated => self.navigate().await,
            ItemState::Navigated => self.locate().await,
            ItemState::TargetLocated => self.submit().await,
            ItemState::Submitted => self.confirm().await,
            ItemState::Init | ItemState::Confirmed | ItemState::Failed => {
                StepOutcome::Fail(format!("no transition out of {state}"))
            }
        }
    }

    async fn authenticate(&mut self) -> StepOutcome {
        if let Err(err) = self.session.navigate(&self.config.landing_url).await {
            return StepOutcome::Fail(format!("landing page unavailable: {err}"));
        }
        settle(self.session, self.config, self.config.settle_after_landing_ms).await;

        let Some(identity) = self.identity.as_ref() else {
            return StepOutcome::Fail(REASON_IDENTITY_NOT_FOUND.to_string());
        };
        let mut injected = 0usize;
        for artifact in &identity.artifacts {
            match self.session.inject_artifact(artifact).await {
                Ok(()) => injected += 1,
                Err(err) => {
                    let message = format!("failed to inject artifact '{}': {err}", artifact.name);
                    warn!("{message}");
                    reporter::report_best_effort(self.reporter, identity.report_owner(), &message)
                        .await;
                }
            }
        }
        debug!(injected, total = identity.artifacts.len(), "artifacts injected");
        if injected == 0 && !identity.artifacts.is_empty() {
            return StepOutcome::Fail(REASON_NO_ARTIFACTS.to_string());
        }

        if let Err(err) = self.session.navigate(&self.config.post_auth_url).await {
            return StepOutcome::Fail(format!("post-authentication load failed: {err}"));
        }
        settle(self.session, self.config, self.config.settle_after_auth_ms).await;
        StepOutcome::Advance
    }

    async fn navigate(&mut self) -> StepOutcome {
        if let Err(err) = self.session.navigate(&self.item.target).await {
            return StepOutcome::Fail(format!("could not load target: {err}"));
        }
        settle(self.session, self.config, self.config.readiness_timeout_ms).await;
        StepOutcome::Advance
    }

    async fn locate(&mut self) -> StepOutcome {
        let deadline = *self.locate_deadline.get_or_insert_with(|| {
            Instant::now() + Duration::from_millis(self.config.locate_timeout_ms)
        });

        match self.session.locate_target().await {
            Ok(true) => StepOutcome::Advance,
            Ok(false) | Err(StepError::Transient(_)) if Instant::now() < deadline => {
                StepOutcome::Retry {
                    after: Duration::from_millis(self.config.readiness_poll_ms),
                }
            }
            Ok(false) | Err(StepError::Transient(_)) => {
                StepOutcome::Fail(REASON_TARGET_NOT_FOUND.to_string())
            }
            Err(StepError::Fatal(reason)) => StepOutcome::Fail(reason),
        }
    }

    async fn submit(&mut self) -> StepOutcome {
        if !self.payload_set {
            if let Err(err) = self.session.set_payload(&self.item.payload).await {
                return StepOutcome::Fail(format!("could not set payload: {err}"));
            }
            self.payload_set = true;
            pause(self.config.settle_after_payload_ms).await;
        }

        if self.commit_attempts < self.config.commit_attempts {
            self.commit_attempts += 1;
            return match self.session.commit().await {
                Ok(()) => StepOutcome::Advance,
                Err(CommitError::Intercepted(reason)) => {
                    warn!(attempt = self.commit_attempts, "commit intercepted: {reason}");
                    StepOutcome::Retry {
                        after: Duration::from_millis(self.config.commit_backoff_ms),
                    }
                }
                Err(err @ CommitError::Other(_)) => StepOutcome::Fail(err.to_string()),
            };
        }

        match self.session.force_commit().await {
            Ok(()) => {
                info!("forced commit succeeded");
                StepOutcome::Advance
            }
            Err(err) => StepOutcome::Fail(format!("forced commit failed: {err}")),
        }
    }

    async fn confirm(&mut self) -> StepOutcome {
        pause(self.config.settle_after_commit_ms).await;
        match self.session.acceptance().await {
            Some(false) => StepOutcome::Fail(REASON_NOT_ACCEPTED.to_string()),
            Some(true) | None => StepOutcome::Advance,
        }
    }
}

/// Wait for the session to report ready, or for `fallback_ms` when it has no
/// readiness signal.
async fn settle(session: &mut dyn RemoteSession, config: &SessionConfig, fallback_ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(fallback_ms);
    loop {
        match session.is_ready().await {
            None => {
                pause(fallback_ms).await;
                return;
            }
            Some(true) => return,
            Some(false) if Instant::now() >= deadline => {
                debug!(budget_ms = fallback_ms, "readiness budget spent; continuing");
                return;
            }
            Some(false) => pause(config.readiness_poll_ms).await,
        }
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn describe_join_error(join: tokio::task::JoinError) -> String {
    if join.is_cancelled() {
        return "worker task cancelled".to_string();
    }
    let payload = join.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {message}")
}
