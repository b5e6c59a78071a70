//! Member leadership using Kubernetes Leases
//!
//! One member per application holds the coordination.k8s.io/v1 Lease. The
//! holder is the member that runs the leader-elected handling (credential
//! bootstrap and infra repair) and may run leader-only actions.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we treat
//! it as "not acquired". Two members can still both observe an election in
//! close succession; the reconcilers are idempotent for that reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::identity::ClusterIdentity;

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "pgkeeper";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Leadership transitions delivered to the event loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This member now holds the lease
    Acquired,
    /// This member lost the lease (renewal failed or was pre-empted)
    Lost,
}

/// Name of the lease for an application
pub fn lease_name(identity: &ClusterIdentity) -> String {
    format!("{}-leader", identity.app_name())
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new elector for this member with default timing
    /// (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, identity: &ClusterIdentity) -> Self {
        Self {
            client,
            lease_name: lease_name(identity),
            namespace: identity.namespace().to_string(),
            identity: identity.member_name(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that mirrors whether this member currently holds the lease
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    /// Whether this member currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Campaign forever, reporting every transition on `events`
    ///
    /// Returns when the receiving side is dropped.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<LeadershipEvent>) {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership...");

        loop {
            let acquired = match self.try_acquire_or_renew().await {
                Ok(held) => held,
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                    false
                }
            };

            let was_leader = self.is_leader.swap(acquired, Ordering::SeqCst);
            let transition = match (was_leader, acquired) {
                (false, true) => Some(LeadershipEvent::Acquired),
                (true, false) => Some(LeadershipEvent::Lost),
                _ => None,
            };

            if let Some(event) = transition {
                info!(identity = %self.identity, ?event, "Leadership changed");
                if events.send(event).await.is_err() {
                    debug!(identity = %self.identity, "Event loop gone, stopping election");
                    return;
                }
            }

            let wait = if acquired {
                self.renew_interval
            } else {
                self.retry_interval
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Who holds the lease right now, if anyone (and it has not expired)
    pub async fn current_holder(&self) -> Result<Option<String>, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if is_expired(&lease, Utc::now()) {
            return Ok(None);
        }
        Ok(lease.spec.and_then(|s| s.holder_identity))
    }

    /// Try to acquire or renew the lease atomically
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return self.create_lease(&api, now).await;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_ref());

        if holder == Some(&self.identity) {
            let mut renewed = existing.clone();
            if let Some(ref mut spec) = renewed.spec {
                spec.renew_time = Some(MicroTime(now));
            }
            return self.replace_lease(&api, renewed, "renew").await;
        }

        if !is_expired(&existing, now) {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;

        let mut taken = self.lease_for(now, transitions + 1);
        taken.metadata.resource_version = Some(resource_version);
        self.replace_lease(&api, taken, "takeover").await
    }

    fn lease_for(&self, now: chrono::DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        match api.create(&PostParams::default(), &self.lease_for(now, 0)).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_lease(
        &self,
        api: &Api<Lease>,
        lease: Lease,
        op: &str,
    ) -> Result<bool, LeaderElectionError> {
        if lease.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(
                self.lease_name.clone(),
            ));
        }
        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, op, "Lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, op, "Lease conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lease so another member can take over without waiting
    /// for expiry. Call during graceful shutdown.
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        if !self.is_leader() {
            return Ok(());
        }
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Merge(&patch),
        )
        .await?;

        self.is_leader.store(false, Ordering::SeqCst);
        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

fn is_expired(lease: &Lease, now: chrono::DateTime<Utc>) -> bool {
    let spec = lease.spec.as_ref();
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}
