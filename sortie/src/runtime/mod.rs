/// Dispatcher construction from explicit collaborators.
pub mod builder;
/// Lease-gated dispatch over a bounded worker pool.
pub mod supervisor;
/// Per-item state machine and the session worker that drives it.
pub mod worker;

pub use builder::DispatcherBuilder;
pub use supervisor::{DispatchReport, Dispatcher, WorkerFailure};
pub use worker::{
    ItemState, ItemStatus, OutcomeRecord, REASON_IDENTITY_NOT_FOUND, REASON_NO_ARTIFACTS,
    REASON_NOT_ACCEPTED, REASON_TARGET_NOT_FOUND, StepOutcome,
};
