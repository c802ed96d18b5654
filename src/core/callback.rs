//! Report delivery once a maintenance task finishes

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::error::{AgentError, Result};
use crate::utils::{AgentConfig, CALLBACK_TIMEOUT_SECS};

/// Destination for finished task reports
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, endpoint: &str, payload: &Value) -> Result<()>;
}

/// Posts reports as JSON to `<base_url>/<endpoint>`
pub struct HttpReportSink {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpReportSink {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("platform-backup-agent/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(CALLBACK_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// The configured callback, if there is one
    pub fn from_config(config: &AgentConfig) -> Result<Option<Self>> {
        match config.backups.callback_url.as_deref() {
            Some(url) if !url.is_empty() => {
                Self::new(url, config.backups.callback_token.clone()).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn deliver(&self, endpoint: &str, payload: &Value) -> Result<()> {
        let url = self.url(endpoint);
        debug!(url = %url, "delivering report");

        let mut request = self.client.post(&url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Protocol {
                status: status.as_u16(),
                body,
            });
        }

        info!(endpoint, "report delivered");
        Ok(())
    }
}

/// Prints reports to stdout, for the command line
pub struct StdoutReportSink;

#[async_trait]
impl ReportSink for StdoutReportSink {
    async fn deliver(&self, _endpoint: &str, payload: &Value) -> Result<()> {
        let text = serde_json::to_string_pretty(payload)
            .map_err(|e| AgentError::Config(format!("encoding report: {}", e)))?;
        println!("{}", text);
        Ok(())
    }
}

/// Hand `payload` to every sink; failures are logged and otherwise dropped
pub async fn deliver_all(sinks: &[std::sync::Arc<dyn ReportSink>], endpoint: &str, payload: &Value) {
    for sink in sinks {
        if let Err(e) = sink.deliver(endpoint, payload).await {
            warn!(endpoint, error = %e, "report delivery failed");
        }
    }
}
