//! Process supervisor interface and its HTTP client
//!
//! The supervisor runs the database and its side services inside the
//! member's container and exposes them over a small JSON API
//! (`/v1/system-info`, `/v1/services`).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use pgkeeper_common::Error;

const COLLABORATOR: &str = "supervisor";

/// Default address of the supervisor API
pub const DEFAULT_SUPERVISOR_URL: &str = "http://localhost:38813";

/// Name of the database service under the supervisor
pub const DATABASE_SERVICE: &str = "postgresql";

/// Run state of a supervised service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Running
    Active,
    /// Stopped
    Inactive,
    /// Exited with an error
    Error,
    /// Waiting to be restarted after failing
    Backoff,
}

/// One supervised service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name
    pub name: String,
    /// Current run state
    pub current: ServiceState,
}

impl ServiceStatus {
    /// Whether the service is running
    pub fn is_running(&self) -> bool {
        self.current == ServiceState::Active
    }
}

/// The local process supervisor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Whether the supervisor answers at all
    async fn is_reachable(&self) -> bool;

    /// Every service currently in the plan
    async fn get_service_statuses(&self) -> Result<Vec<ServiceStatus>, Error>;

    /// Restart one service
    async fn restart_service(&self, name: &str) -> Result<(), Error>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

/// HTTP client for the supervisor API
pub struct HttpSupervisor {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSupervisor {
    /// Client for the API at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProcessSupervisor for HttpSupervisor {
    async fn is_reachable(&self) -> bool {
        match self
            .http
            .get(format!("{}/v1/system-info", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "supervisor not reachable");
                false
            }
        }
    }

    async fn get_service_statuses(&self) -> Result<Vec<ServiceStatus>, Error> {
        let response = self
            .http
            .get(format!("{}/v1/services", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::remote(
                COLLABORATOR,
                format!("GET /v1/services returned {}", response.status()),
            ));
        }
        let envelope: Envelope<Vec<ServiceStatus>> = response.json().await?;
        Ok(envelope.result)
    }

    async fn restart_service(&self, name: &str) -> Result<(), Error> {
        let response = self
            .http
            .post(format!("{}/v1/services", self.base_url))
            .json(&json!({ "action": "restart", "services": [name] }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::remote(
                COLLABORATOR,
                format!("restart of {name} returned {}", response.status()),
            ));
        }
        Ok(())
    }
}
