//! Credential Bootstrapper
//!
//! Runs on every leader-election event. The Cluster Bootstrap Flag in
//! application-scope peer state is the only trigger: while it is unset the
//! full bootstrap runs (credentials, Services and the leader designation
//! before the flag), and once it is set an election only repairs the
//! leader designation.
//!
//! Multiple members may observe an election at once and there is no lock.
//! The flag is written last, so any failure before it leaves the whole
//! sequence to run again on the next election.

use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use pgkeeper_common::users::generate_password;
use pgkeeper_common::{
    Error, Scope, SystemUser, CLUSTER_INITIALISED_KEY, CLUSTER_INITIALISED_VALUE,
};
use pgkeeper_secrets::{PeerState, SecretStore};

use crate::networking::{InfraReconciler, RepairOutcome};

/// What an election event did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Credentials generated, Services created, designation checked, flag set
    Bootstrapped,
    /// Cluster already initialised; leader designation checked
    Repaired(RepairOutcome),
}

/// Handles leader-election events
pub struct CredentialBootstrapper {
    peers: Arc<dyn PeerState>,
    secrets: Arc<SecretStore>,
    infra: Arc<InfraReconciler>,
}

impl CredentialBootstrapper {
    /// Create a bootstrapper
    pub fn new(
        peers: Arc<dyn PeerState>,
        secrets: Arc<SecretStore>,
        infra: Arc<InfraReconciler>,
    ) -> Self {
        Self {
            peers,
            secrets,
            infra,
        }
    }

    /// Whether the cluster has completed its first bootstrap
    pub async fn is_initialised(&self) -> Result<bool, Error> {
        Ok(self
            .peers
            .get(Scope::Application, CLUSTER_INITIALISED_KEY)
            .await?
            .is_some_and(|v| v == CLUSTER_INITIALISED_VALUE))
    }

    /// Handle this member becoming leader
    pub async fn on_leader_elected(&self) -> Result<BootstrapOutcome, Error> {
        if self.is_initialised().await? {
            let outcome = self.infra.repair_leader_designation().await?;
            info!(outcome = ?outcome, "cluster already initialised, leader designation checked");
            return Ok(BootstrapOutcome::Repaired(outcome));
        }

        info!("first leader election for this cluster, generating credentials");
        for user in SystemUser::ALL {
            let password = Zeroizing::new(generate_password());
            self.secrets
                .set(Scope::Application, &user.password_key(), Some(password.as_str()))
                .await?;
        }

        self.infra.ensure_services().await?;
        let designation = self.infra.repair_leader_designation().await?;
        debug!(outcome = ?designation, "leader designation checked");

        self.peers
            .set(
                Scope::Application,
                CLUSTER_INITIALISED_KEY,
                CLUSTER_INITIALISED_VALUE,
            )
            .await?;
        info!("cluster bootstrapped");
        Ok(BootstrapOutcome::Bootstrapped)
    }
}
