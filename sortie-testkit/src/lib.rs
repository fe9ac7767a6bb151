//! Scripted collaborators for exercising sortie without a live remote.

mod remote;
mod session;
mod storage;
mod store;

pub use remote::{RecordingReporter, ScriptedAuthority};
pub use session::{CallRecord, PayloadScript, ScriptedBackend, ScriptedSession, SessionCall, SessionScript};
pub use storage::LockedStorage;
pub use store::InMemoryIdentityStore;

use sortie::{CredentialArtifact, Identity, MachineIdentity, ReaperConfig, SessionConfig, SortieConfig};

/// Configuration with every delay zeroed and fast teardown retries.
pub fn quick_config() -> SortieConfig {
    SortieConfig {
        session: SessionConfig {
            landing_url: "https://remote.test/".into(),
            post_auth_url: "https://remote.test/home".into(),
            ..SessionConfig::immediate()
        },
        reaper: ReaperConfig {
            grace_ms: 0,
            max_attempts: 3,
            backoff_ms: 1,
        },
        ..SortieConfig::default()
    }
}

/// Identity `name` carrying one artifact per value in `artifact_values`.
pub fn identity(name: &str, artifact_values: &[&str]) -> Identity {
    artifact_values
        .iter()
        .enumerate()
        .fold(
            Identity::new(name).with_email(format!("{name}@example.com")),
            |identity, (i, value)| {
                identity.with_artifact(CredentialArtifact {
                    name: format!("cookie-{i}"),
                    value: value.to_string(),
                    domain: None,
                    path: Some("/".into()),
                })
            },
        )
}

pub fn test_machine() -> MachineIdentity {
    MachineIdentity::from_raw("machine-under-test")
}
