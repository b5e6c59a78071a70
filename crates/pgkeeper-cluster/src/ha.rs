//! HA manager interface and its Patroni REST client

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use pgkeeper_common::Error;

const COLLABORATOR: &str = "ha-manager";

/// Default address of the HA manager's REST API inside the member
pub const DEFAULT_HA_URL: &str = "http://localhost:8008";

/// Inputs for re-rendering the HA manager configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderParams {
    /// PostgreSQL parameters to push into the dynamic configuration
    pub parameters: BTreeMap<String, String>,
}

/// Cluster view exposed by the HA manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HaManager: Send + Sync {
    /// Member currently holding the leader lock
    ///
    /// A cluster with no leader is a retryable error.
    async fn get_primary(&self) -> Result<String, Error>;

    /// Whether this member's database is up and part of the cluster
    async fn is_member_started(&self) -> bool;

    /// Whether every member is running or streaming
    async fn are_all_members_ready(&self) -> bool;

    /// Push configuration and have the HA manager reload it
    async fn render_configuration(&self, params: &RenderParams) -> Result<(), Error>;
}

#[derive(Debug, Deserialize)]
struct ClusterView {
    #[serde(default)]
    members: Vec<ClusterMember>,
}

#[derive(Debug, Deserialize)]
struct ClusterMember {
    name: String,
    role: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthView {
    state: String,
}

fn is_ready_state(state: &str) -> bool {
    matches!(state, "running" | "streaming")
}

/// Patroni REST API client
pub struct PatroniClient {
    http: reqwest::Client,
    base_url: String,
}

impl PatroniClient {
    /// Client for the API at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn cluster(&self) -> Result<ClusterView, Error> {
        let response = self
            .http
            .get(format!("{}/cluster", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::remote(
                COLLABORATOR,
                format!("GET /cluster returned {}", response.status()),
            ));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl HaManager for PatroniClient {
    async fn get_primary(&self) -> Result<String, Error> {
        self.cluster()
            .await?
            .members
            .into_iter()
            .find(|m| m.role == "leader" || m.role == "standby_leader")
            .map(|m| m.name)
            .ok_or_else(|| Error::remote(COLLABORATOR, "cluster has no primary"))
    }

    async fn is_member_started(&self) -> bool {
        let response = match self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "health check failed");
                return false;
            }
        };
        match response.json::<HealthView>().await {
            Ok(health) => is_ready_state(&health.state),
            Err(e) => {
                debug!(error = %e, "unreadable health response");
                false
            }
        }
    }

    async fn are_all_members_ready(&self) -> bool {
        match self.cluster().await {
            Ok(view) => view
                .members
                .iter()
                .all(|m| m.state.as_deref().is_some_and(is_ready_state)),
            Err(e) => {
                debug!(error = %e, "failed to read cluster members");
                false
            }
        }
    }

    async fn render_configuration(&self, params: &RenderParams) -> Result<(), Error> {
        let body = json!({ "postgresql": { "parameters": params.parameters } });
        let response = self
            .http
            .patch(format!("{}/config", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::remote(
                COLLABORATOR,
                format!("PATCH /config returned {}", response.status()),
            ));
        }
        debug!(parameters = params.parameters.len(), "configuration pushed");
        Ok(())
    }
}
