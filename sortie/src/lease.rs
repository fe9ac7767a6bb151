//! The process-wide execution lease and its background renewal.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::authority::LicenseAuthority;
use crate::config::LeaseConfig;
use crate::error::LeaseError;
use crate::machine::MachineIdentity;
use crate::shutdown::ShutdownToken;
use crate::telemetry;

/// Snapshot of the locally cached lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Fingerprint of this machine.
    pub holder: MachineIdentity,
    /// Owning account, set while credentials are cached.
    pub owner: Option<String>,
    /// Cached validity. Only acquire, release, verify and the renewal task change it.
    pub valid: bool,
    /// Last successful confirmation from the authority.
    pub last_verified_at: Option<DateTime<Utc>>,
    /// Most recent denial or conflict, kept for display.
    pub last_denial: Option<LeaseError>,
}

#[derive(Debug, Default)]
struct LeaseState {
    owner: Option<String>,
    credential: Option<String>,
    valid: bool,
    last_verified_at: Option<DateTime<Utc>>,
    last_denial: Option<LeaseError>,
}

/// Handle to the background renewal task.
#[derive(Debug)]
struct RenewalHandle {
    shutdown: ShutdownToken,
    handle: JoinHandle<()>,
}

impl RenewalHandle {
    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.handle.await {
            warn!("lease renewal task ended abnormally: {err}");
        }
    }
}

struct LeaseInner {
    authority: Arc<dyn LicenseAuthority>,
    holder: MachineIdentity,
    renewal_interval: Duration,
    state: Mutex<LeaseState>,
    renewal: tokio::sync::Mutex<Option<RenewalHandle>>,
}

/// Client for the single global execution lease.
///
/// Cloning yields another handle to the same lease. Validity is cached and
/// refreshed by one background renewal task; callers read it with
/// [`LeaseClient::is_valid`] instead of contacting the authority per operation.
#[derive(Clone)]
pub struct LeaseClient {
    inner: Arc<LeaseInner>,
}

impl std::fmt::Debug for LeaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LeaseClient")
            .field("holder", &self.inner.holder)
            .field("owner", &state.owner)
            .field("valid", &state.valid)
            .field("renewal_interval", &self.inner.renewal_interval)
            .finish()
    }
}

impl LeaseClient {
    pub fn new(
        authority: Arc<dyn LicenseAuthority>,
        holder: MachineIdentity,
        config: &LeaseConfig,
    ) -> Self {
        Self::with_interval(authority, holder, config.renewal_interval())
    }

    pub fn with_interval(
        authority: Arc<dyn LicenseAuthority>,
        holder: MachineIdentity,
        renewal_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                authority,
                holder,
                renewal_interval,
                state: Mutex::new(LeaseState::default()),
                renewal: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn holder(&self) -> &MachineIdentity {
        &self.inner.holder
    }

    /// Cached validity.
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().valid
    }

    pub fn snapshot(&self) -> Lease {
        let state = self.inner.state.lock();
        Lease {
            holder: self.inner.holder.clone(),
            owner: state.owner.clone(),
            valid: state.valid,
            last_verified_at: state.last_verified_at,
            last_denial: state.last_denial.clone(),
        }
    }

    /// Whether the background renewal task is running.
    pub async fn renewal_active(&self) -> bool {
        self.inner
            .renewal
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Acquire the lease for `owner`.
    ///
    /// On success the lease becomes valid and a single renewal task is
    /// started, replacing any previous one. A denial or conflict invalidates
    /// the lease and stops renewal; a conflict carries the other holder's last
    /// access and is not retried. A transient failure changes nothing: a lease
    /// that was already held keeps its renewal task.
    pub async fn acquire(&self, owner: &str, credential: &str) -> Result<(), LeaseError> {
        let span = telemetry::lease_span("acquire", owner);
        async {
            match self
                .inner
                .authority
                .verify(owner, credential, &self.inner.holder)
                .await
            {
                Ok(()) => {
                    {
                        let mut state = self.inner.state.lock();
                        state.owner = Some(owner.to_string());
                        state.credential = Some(credential.to_string());
                        state.valid = true;
                        state.last_verified_at = Some(Utc::now());
                        state.last_denial = None;
                    }
                    telemetry::record_lease_validity(true);
                    self.start_renewal().await;
                    info!(holder = %self.inner.holder, "lease acquired");
                    Ok(())
                }
                Err(err) if err.is_denial() => {
                    self.stop_renewal().await;
                    {
                        let mut state = self.inner.state.lock();
                        state.valid = false;
                        state.last_denial = Some(err.clone());
                    }
                    telemetry::record_lease_validity(false);
                    warn!(error = %err, "lease acquisition denied");
                    Err(err)
                }
                Err(err) => {
                    warn!(error = %err, "lease acquisition failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Re-check the lease against the authority using cached credentials.
    ///
    /// Returns `false` on any failure. A transient failure leaves the cached
    /// validity untouched; a denial invalidates it.
    pub async fn verify(&self) -> bool {
        match reverify(&self.inner).await {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "lease verification failed");
                false
            }
        }
    }

    /// Release the lease. Best-effort remotely, unconditional locally.
    ///
    /// Safe to call any number of times, including before any acquisition.
    pub async fn release(&self) {
        self.stop_renewal().await;

        let owner = {
            let mut state = self.inner.state.lock();
            let owner = state.owner.take();
            state.credential = None;
            state.valid = false;
            owner
        };
        telemetry::record_lease_validity(false);

        let Some(owner) = owner else {
            debug!("release requested without a held lease");
            return;
        };

        let span = telemetry::lease_span("release", &owner);
        if let Err(err) = self
            .inner
            .authority
            .release(&owner, &self.inner.holder)
            .instrument(span)
            .await
        {
            warn!(owner = %owner, "remote lease release failed: {err}");
        }
    }

    /// Stop the renewal task and wait for it, leaving the lease held remotely.
    pub async fn shutdown(&self) {
        self.stop_renewal().await;
    }

    async fn start_renewal(&self) {
        let shutdown = ShutdownToken::new();
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.renewal_interval;
        let handle = tokio::spawn(renewal_loop(weak, interval, shutdown.clone()));

        let previous = self
            .inner
            .renewal
            .lock()
            .await
            .replace(RenewalHandle { shutdown, handle });
        if let Some(previous) = previous {
            previous.stop().await;
        }
        info!(interval_secs = interval.as_secs(), "started lease renewal");
    }

    async fn stop_renewal(&self) {
        let handle = self.inner.renewal.lock().await.take();
        if let Some(handle) = handle {
            debug!("stopping lease renewal");
            handle.stop().await;
        }
    }
}

async fn reverify(inner: &LeaseInner) -> Result<(), LeaseError> {
    let (owner, credential) = {
        let state = inner.state.lock();
        match (&state.owner, &state.credential) {
            (Some(owner), Some(credential)) => (owner.clone(), credential.clone()),
            _ => return Err(LeaseError::NotAcquired),
        }
    };

    let result = inner
        .authority
        .verify(&owner, &credential, &inner.holder)
        .instrument(telemetry::lease_span("verify", &owner))
        .await;

    let mut state = inner.state.lock();
    // A release that raced this call wins.
    if state.owner.as_deref() != Some(owner.as_str()) {
        return Err(LeaseError::NotAcquired);
    }
    match &result {
        Ok(()) => {
            state.valid = true;
            state.last_verified_at = Some(Utc::now());
            state.last_denial = None;
            drop(state);
            telemetry::record_lease_validity(true);
        }
        Err(err) if err.is_denial() => {
            state.valid = false;
            state.last_denial = Some(err.clone());
            drop(state);
            telemetry::record_lease_validity(false);
        }
        Err(_) => {}
    }
    result
}

async fn renewal_loop(inner: Weak<LeaseInner>, interval: Duration, shutdown: ShutdownToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("lease renewal shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };

        info!("periodic lease verification");
        match reverify(&inner).await {
            Ok(()) => {}
            Err(err) if err.is_denial() => {
                warn!(error = %err, "lease invalidated during renewal; stopping renewal");
                break;
            }
            Err(err) => {
                warn!(error = %err, "lease renewal could not reach authority; will retry next cycle");
            }
        }
    }
}
