//! Sortie - lease-gated concurrent session dispatch.
//!
//! Runs a list of `(identity, payload)` work items against a rate-limited,
//! unreliable remote service across isolated parallel workers. Dispatch is
//! gated by a single-seat license lease that is renewed in the background and
//! released deterministically.
//!
//! # Core Concepts
//!
//! - **Lease**: [`LeaseClient`] acquires, renews, verifies, and releases the
//!   global execution lease through a [`LicenseAuthority`], keyed by the
//!   [`MachineIdentity`] fingerprint.
//!
//! - **Partitioning**: [`divide`] splits the ordered work list into contiguous,
//!   non-empty [`Batch`]es, one per worker.
//!
//! - **Workers**: each worker owns a [`WorkerContext`] and a [`RemoteSession`]
//!   opened by a [`SessionBackend`], and drives its items one at a time
//!   through the [`ItemState`] machine.
//!
//! - **Reaper**: [`teardown`] removes a worker's storage with bounded retries.
//!
//! - **Runtime**: [`Dispatcher`] (built with [`DispatcherBuilder`]) ties the
//!   pieces together and returns a [`DispatchReport`] with one
//!   [`OutcomeRecord`] per item.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sortie::*;
//!
//! let config = SortieConfig::load_from_path("sortie.json".as_ref())?;
//! let authority = Arc::new(HttpLicenseAuthority::new(&config.lease)?);
//! let lease = LeaseClient::new(authority, MachineIdentity::detect(), &config.lease);
//! lease.acquire("owner@example.com", "secret").await?;
//!
//! let dispatcher = DispatcherBuilder::new(config.clone())
//!     .with_backend(backend)
//!     .with_identity_store(Arc::new(JsonFileStore::new(&config.dispatch.identity_root)))
//!     .with_reporter(Arc::new(HttpErrorReporter::new(&config.lease)?))
//!     .build()?;
//!
//! let report = dispatcher
//!     .submit("https://example.test/item/42", pairs, 3, "default", &lease)
//!     .await?;
//! lease.release().await;
//! ```

/// Remote license authority seam and its HTTP implementation.
pub mod authority;

/// Layered configuration: JSON file over defaults, then environment overrides.
pub mod config;

/// Error taxonomy.
pub mod error;

/// Identity and content records, their store, and the shared accessor.
pub mod identity;

/// License lease client with background renewal.
///
/// The `lease` module provides:
/// - [`LeaseClient`] - cloneable handle over the process-wide lease state
/// - [`Lease`] - snapshot of the cached lease
pub mod lease;

/// Host fingerprint used as the lease holder token.
pub mod machine;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

/// Positional work partitioning.
pub mod partition;

/// Per-worker storage and retrying teardown.
pub mod reaper;

/// Best-effort failure reporting.
pub mod reporter;

/// Dispatcher, session worker, and per-item state machine.
///
/// The `runtime` module provides:
/// - [`Dispatcher`] - lease-gated entrypoint
/// - [`DispatcherBuilder`] - construction from explicit collaborators
/// - [`ItemState`] and [`StepOutcome`] - the per-item state machine
/// - [`OutcomeRecord`] and [`DispatchReport`] - results
pub mod runtime;

/// Remote session seam driven by workers.
pub mod session;

/// Cooperative cancellation for background tasks.
pub mod shutdown;

/// Tracing spans and outcome recorders.
pub mod telemetry;

pub use authority::*;
pub use config::*;
pub use error::*;
pub use identity::*;
pub use lease::*;
pub use machine::*;
pub use partition::*;
pub use reaper::*;
pub use reporter::*;
pub use runtime::*;
pub use session::*;
pub use shutdown::*;
