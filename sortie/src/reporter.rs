//! Best-effort forwarding of per-item failure diagnostics.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{error, info};

use crate::config::LeaseConfig;
use crate::telemetry;

/// Remote sink for failure diagnostics.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Deliver one diagnostic for `owner`.
    async fn report(&self, owner: &str, message: &str) -> anyhow::Result<()>;
}

/// Deliver a report, logging and swallowing any failure.
pub async fn report_best_effort(reporter: &dyn ErrorReporter, owner: &str, message: &str) {
    match reporter.report(owner, message).await {
        Ok(()) => {
            info!(owner, "error reported: {message}");
            telemetry::record_error_report(true);
        }
        Err(err) => {
            error!(owner, "failed to report error: {err}");
            telemetry::record_error_report(false);
        }
    }
}

/// Reporter posting to the collector's `erros-automacao` endpoint.
#[derive(Clone, Debug)]
pub struct HttpErrorReporter {
    client: reqwest::Client,
    api_url: String,
}

impl HttpErrorReporter {
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
}

#[async_trait]
impl ErrorReporter for HttpErrorReporter {
    async fn report(&self, owner: &str, message: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/erros-automacao", self.api_url))
            .json(&json!({ "email": owner, "erro": message }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("collector returned {}: {}", status.as_u16(), body)
    }
}

/// Reporter that drops everything. Useful when no collector is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

#[async_trait]
impl ErrorReporter for NoopReporter {
    async fn report(&self, _owner: &str, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
