//! Server health probe (`GET /health`).

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use tracing::debug;

use crate::rest::{parse_server_url, ApiError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    /// No probe has completed yet
    Unknown,
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "unhealthy: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    url: Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let url = parse_server_url(server_url)?
            .join("/health")
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            url,
            http: reqwest::Client::new(),
            timeout,
        })
    }

    /// One probe. Never fails; problems become `Unhealthy`.
    pub async fn check(&self) -> HealthStatus {
        let result = self
            .http
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await;

        let status = match result {
            Ok(response) if response.status().is_success() => HealthStatus::Healthy,
            Ok(response) => HealthStatus::Unhealthy {
                reason: format!(
                    "Server responded with status {}",
                    response.status().as_u16()
                ),
            },
            Err(e) if e.is_timeout() => HealthStatus::Unhealthy {
                reason: "Server health check timed out".to_string(),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("Health check failed: {e}"),
            },
        };

        debug!(
            component = "health",
            event = "health.probe",
            url = %self.url,
            status = %status,
            "Health probe finished"
        );
        status
    }
}
