//! Remote license authority: the collaborator that grants and revokes leases.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::error::LeaseError;
use crate::machine::MachineIdentity;

/// Marker the authority uses when the lease is held by another machine.
const IN_USE_MARKER: &str = "já está em uso";

/// The remote party that decides who holds the lease.
#[async_trait]
pub trait LicenseAuthority: Send + Sync {
    /// Confirm that `owner` may hold the lease on `machine`.
    ///
    /// `Ok(())` means confirmed. Errors are classified so callers can tell a
    /// transient outage from a denial.
    async fn verify(
        &self,
        owner: &str,
        credential: &str,
        machine: &MachineIdentity,
    ) -> Result<(), LeaseError>;

    /// Release the lease held by `owner` on `machine`.
    async fn release(&self, owner: &str, machine: &MachineIdentity) -> anyhow::Result<()>;
}

/// Error body returned by the authority on non-200 replies.
#[derive(Debug, Default, Deserialize)]
struct AuthorityReply {
    #[serde(default)]
    erro: Option<String>,
    #[serde(default, rename = "ultimoAcesso")]
    ultimo_acesso: Option<Value>,
}

/// HTTP implementation speaking the authority's JSON protocol.
#[derive(Clone, Debug)]
pub struct HttpLicenseAuthority {
    client: reqwest::Client,
    api_url: String,
}

impl HttpLicenseAuthority {
    /// Build a client with the configured request timeout.
    pub fn new(config: &LeaseConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(client, &config.api_url))
    }

    pub fn with_client(client: reqwest::Client, api_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.api_url, endpoint)
    }
}

#[async_trait]
impl LicenseAuthority for HttpLicenseAuthority {
    async fn verify(
        &self,
        owner: &str,
        credential: &str,
        machine: &MachineIdentity,
    ) -> Result<(), LeaseError> {
        debug!(owner, "verifying license");
        let response = self
            .client
            .post(self.url("auth/verify"))
            .json(&json!({
                "email": owner,
                "password": credential,
                "machineId": machine.as_str(),
            }))
            .send()
            .await
            .map_err(|e| LeaseError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK {
            info!(owner, "license verified");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| {
                LeaseError::Transient(format!("reply ({}) cut short: {e}", status.as_u16()))
            })?;
        classify_rejection(status, &body)
    }

    async fn release(&self, owner: &str, machine: &MachineIdentity) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url("auth/liberar-maquina"))
            .json(&json!({
                "email": owner,
                "machineId": machine.as_str(),
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            info!(owner, "machine released");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reply: AuthorityReply = serde_json::from_str(&body).unwrap_or_default();
        anyhow::bail!(
            "release rejected ({}): {}",
            status.as_u16(),
            reply.erro.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

fn classify_rejection(status: StatusCode, body: &str) -> Result<(), LeaseError> {
    if status.is_server_error() {
        warn!(status = status.as_u16(), "license authority error");
        return Err(LeaseError::Transient(format!(
            "authority returned {}",
            status.as_u16()
        )));
    }

    // Unparseable bodies are never a denial.
    let reply: AuthorityReply = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(_) => {
            warn!(status = status.as_u16(), "unreadable license authority reply");
            return Err(LeaseError::Transient(format!(
                "unreadable reply ({})",
                status.as_u16()
            )));
        }
    };

    let reason = reply
        .erro
        .unwrap_or_else(|| "unknown error".to_string());

    let in_use = reason.to_lowercase().contains(IN_USE_MARKER) || reply.ultimo_acesso.is_some();
    if status == StatusCode::FORBIDDEN && in_use {
        let last_access = reply.ultimo_acesso.map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        });
        warn!(last_access = ?last_access, "license already in use on another machine");
        return Err(LeaseError::Conflict {
            reason,
            last_access,
        });
    }

    warn!(status = status.as_u16(), reason = %reason, "license denied");
    Err(LeaseError::Denied { reason })
}
