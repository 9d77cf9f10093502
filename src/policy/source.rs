use crate::api::ApiResponse;
use crate::errors::{QuotaError, Result};
use crate::policy::Policy;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Where the complete enabled-policy set comes from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch every policy the system of record currently publishes.
    async fn fetch_enabled(&self) -> Result<Vec<Policy>>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Control-plane REST client.
pub struct HttpPolicySource {
    client: reqwest::Client,
    url: String,
}

impl HttpPolicySource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: enabled_policies_url(base_url),
        })
    }
}

fn enabled_policies_url(base_url: &str) -> String {
    format!("{}/api/v1/policies/enabled", base_url.trim_end_matches('/'))
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch_enabled(&self) -> Result<Vec<Policy>> {
        debug!("Fetching enabled policies from {}", self.url);

        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(QuotaError::PolicySourceError(format!(
                "control plane returned HTTP {}",
                status
            )));
        }

        let body: ApiResponse<Vec<Policy>> = response.json().await?;
        decode_envelope(body)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// An unsuccessful envelope is a failed sync, never an empty policy set.
fn decode_envelope(body: ApiResponse<Vec<Policy>>) -> Result<Vec<Policy>> {
    if !body.success {
        let message = body
            .error
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| "unsuccessful response without error info".to_string());
        warn!("Control plane rejected policy fetch: {}", message);
        return Err(QuotaError::PolicySourceError(message));
    }

    Ok(body.data.unwrap_or_default())
}

/// Policies from a JSON array on disk.
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn fetch_enabled(&self) -> Result<Vec<Policy>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let policies: Vec<Policy> = serde_json::from_str(&contents)?;
        Ok(policies)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
