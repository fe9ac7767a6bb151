//! Stable machine fingerprint used as the lease holder token.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

/// Fingerprint derived from host attributes. Immutable for the life of the process.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MachineIdentity(String);

impl MachineIdentity {
    /// Derive the fingerprint for the current host.
    ///
    /// Falls back to a random UUID when no host attribute can be read, which
    /// means the lease will not survive a restart on that host.
    pub fn detect() -> Self {
        let attributes = host_attributes();
        if attributes.iter().all(|a| a.is_empty()) {
            warn!("no host attributes readable; using a random machine id");
            return Self(Uuid::new_v4().to_string());
        }
        Self::from_attributes(&attributes)
    }

    /// Hash an explicit attribute list. Equal lists produce equal fingerprints.
    pub fn from_attributes<S: AsRef<str>>(attributes: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for attr in attributes {
            hasher.update(attr.as_ref().as_bytes());
        }
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Wrap an already-computed fingerprint.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MachineIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn host_attributes() -> Vec<String> {
    let read = |path: &str| {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let node = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| read("/etc/hostname"));

    vec![
        node.clone(),
        std::env::consts::ARCH.to_string(),
        std::env::consts::OS.to_string(),
        read("/etc/machine-id"),
        node,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_sha256_hex() {
        let a = MachineIdentity::from_attributes(&["host", "x86_64", "linux"]);
        let b = MachineIdentity::from_attributes(&["host", "x86_64", "linux"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_hosts_differ() {
        let a = MachineIdentity::from_attributes(&["host-a"]);
        let b = MachineIdentity::from_attributes(&["host-b"]);
        assert_ne!(a, b);
    }

    #[test]
    fn detect_is_deterministic_within_process() {
        assert_eq!(MachineIdentity::detect(), MachineIdentity::detect());
    }
}
