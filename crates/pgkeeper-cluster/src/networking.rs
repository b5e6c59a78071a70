//! Infra Reconciler
//!
//! Owns the externally visible networking objects of the cluster: the
//! primary/replica discovery Services, the leader annotation on the HA
//! manager's Endpoints object, and the discovery labels on each member Pod.
//!
//! Everything is keyed by names derived from [`ClusterIdentity`], so every
//! operation here is safe to repeat.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use serde_json::json;
use tracing::{debug, error, info, warn};

use pgkeeper_common::{ClusterIdentity, Error, CREATED_BY_LABEL, LEADER_ANNOTATION};

use crate::infra::{InfraApi, ResourceKind};

/// Port PostgreSQL listens on in every member
pub const DATABASE_PORT: u16 = 5432;

/// Label the HA manager's selectors match members on
pub const APPLICATION_LABEL: &str = "application";

/// Value of [`APPLICATION_LABEL`] on member Pods
pub const APPLICATION_LABEL_VALUE: &str = "patroni";

/// Label carrying the HA cluster name
pub const CLUSTER_NAME_LABEL: &str = "cluster-name";

/// Role label the HA manager maintains on member Pods
pub const ROLE_LABEL: &str = "role";

/// Result of a leader designation repair
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The annotation already named a live member; nothing was written
    AlreadyCurrent,
    /// The annotation was set to this member
    Repaired,
    /// The Endpoints object does not exist yet
    ObjectMissing,
}

/// Creates and repairs networking objects for one member
pub struct InfraReconciler {
    api: Arc<dyn InfraApi>,
    identity: ClusterIdentity,
}

impl InfraReconciler {
    /// Reconciler acting as `identity`
    pub fn new(api: Arc<dyn InfraApi>, identity: ClusterIdentity) -> Self {
        Self { api, identity }
    }

    /// Identity this reconciler acts as
    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    /// Create the primary and replica Services
    ///
    /// The Services are owned by whatever owns the first member (the
    /// StatefulSet), so they survive any single member. Failures other than
    /// "already exists" are returned to the caller.
    pub async fn ensure_services(&self) -> Result<(), Error> {
        let namespace = self.identity.namespace();
        let owners = self.first_pod_owner_references().await?;

        let services = [
            (self.identity.primary_service_name(), "master"),
            (self.identity.replicas_service_name(), "replica"),
        ];
        for (name, role) in services {
            let service = self.service_object(&name, role, &owners)?;
            match self
                .api
                .apply(ResourceKind::Service, &name, namespace, &service)
                .await
            {
                Ok(()) => info!(service = %name, "service applied"),
                Err(e) if e.is_already_exists() => debug!(service = %name, "service already exists"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Make sure the leader annotation names a live member
    ///
    /// A missing Endpoints object is benign: the HA manager has not created
    /// it yet. Any other failure is returned.
    pub async fn repair_leader_designation(&self) -> Result<RepairOutcome, Error> {
        let namespace = self.identity.namespace();
        let endpoints_name = self.identity.cluster_name();
        let member = self.identity.member_name();

        let endpoints = match self
            .api
            .get(ResourceKind::Endpoints, &endpoints_name, namespace)
            .await
        {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!(endpoints = %endpoints_name, "endpoints not created yet, skipping leader repair");
                return Ok(RepairOutcome::ObjectMissing);
            }
            Err(e) => return Err(e),
        };

        let designated = endpoints
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LEADER_ANNOTATION))
            .filter(|v| !v.is_empty());

        if let Some(designated) = designated {
            if *designated == member || self.member_exists(designated).await? {
                debug!(leader = %designated, "leader designation is current");
                return Ok(RepairOutcome::AlreadyCurrent);
            }
            info!(stale = %designated, member = %member, "replacing stale leader designation");
        } else {
            info!(member = %member, "leader designation missing, setting it");
        }

        let patch = json!({ "metadata": { "annotations": { LEADER_ANNOTATION: member } } });
        match self
            .api
            .patch(ResourceKind::Endpoints, &endpoints_name, namespace, &patch)
            .await
        {
            Ok(()) => Ok(RepairOutcome::Repaired),
            Err(e) if e.is_not_found() => {
                debug!(endpoints = %endpoints_name, "endpoints disappeared before the leader repair");
                Ok(RepairOutcome::ObjectMissing)
            }
            Err(e) => Err(e),
        }
    }

    /// Label this member's Pod so the HA manager's selectors find it
    pub async fn patch_member_labels(&self) -> Result<(), Error> {
        let member = self.identity.member_name();
        let patch = json!({
            "metadata": {
                "labels": {
                    APPLICATION_LABEL: APPLICATION_LABEL_VALUE,
                    CLUSTER_NAME_LABEL: self.identity.cluster_name(),
                }
            }
        });
        self.api
            .patch(ResourceKind::Pod, &member, self.identity.namespace(), &patch)
            .await
    }

    /// Replicas the member StatefulSet is scaled to, `None` once it is gone
    ///
    /// An unset `spec.replicas` means the API default of one.
    pub async fn desired_replicas(&self) -> Result<Option<i64>, Error> {
        match self
            .api
            .get(
                ResourceKind::StatefulSet,
                self.identity.app_name(),
                self.identity.namespace(),
            )
            .await
        {
            Ok(set) => Ok(Some(set.data["spec"]["replicas"].as_i64().unwrap_or(1))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Hand the cluster's networking objects over to the first member's owner
    ///
    /// Runs while this member is being removed. Nothing here may block the
    /// removal, so failures are logged and swallowed.
    pub async fn teardown(&self) {
        let namespace = self.identity.namespace();

        let owners = match self.first_pod_owner_references().await {
            Ok(owners) => owners,
            Err(e) => {
                error!(error = %e, "failed to get first pod info");
                return;
            }
        };

        let selector = format!("{}={}", CREATED_BY_LABEL, self.identity.app_name());
        let mut objects = Vec::new();
        for kind in [ResourceKind::Endpoints, ResourceKind::Service] {
            match self.api.list(kind, namespace, &selector).await {
                Ok(items) => objects.extend(items.into_iter().map(|obj| (kind, obj))),
                Err(e) => {
                    error!(
                        error = %e,
                        "failed to get the k8s resources created by the operator and the HA manager"
                    );
                    return;
                }
            }
        }

        for (kind, mut object) in objects {
            let Some(name) = object.metadata.name.clone() else {
                warn!(kind = %kind, "skipping listed object without a name");
                continue;
            };
            let mut references: Vec<OwnerReference> = object
                .metadata
                .owner_references
                .take()
                .unwrap_or_default()
                .into_iter()
                .filter(|r| r.kind != "Pod")
                .collect();
            for owner in &owners {
                if !references.contains(owner) {
                    references.push(owner.clone());
                }
            }
            object.metadata.owner_references = Some(references);
            object.metadata.managed_fields = None;
            object.metadata.resource_version = None;
            object.types = Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: kind.as_str().to_string(),
            });

            if let Err(e) = self.api.apply(kind, &name, namespace, &object).await {
                error!(kind = %kind, name = %name, error = %e, "failed to patch k8s {} {}", kind, name);
            }
        }
    }

    async fn first_pod_owner_references(&self) -> Result<Vec<OwnerReference>, Error> {
        let pod = self
            .api
            .get(
                ResourceKind::Pod,
                &self.identity.first_member_name(),
                self.identity.namespace(),
            )
            .await?;
        Ok(pod.metadata.owner_references.unwrap_or_default())
    }

    async fn member_exists(&self, name: &str) -> Result<bool, Error> {
        match self
            .api
            .get(ResourceKind::Pod, name, self.identity.namespace())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn service_object(
        &self,
        name: &str,
        role: &str,
        owners: &[OwnerReference],
    ) -> Result<DynamicObject, Error> {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": name,
                "namespace": self.identity.namespace(),
                "labels": { CREATED_BY_LABEL: self.identity.app_name() },
                "ownerReferences": owners,
            },
            "spec": {
                "ports": [{
                    "name": "database",
                    "port": DATABASE_PORT,
                    "targetPort": DATABASE_PORT,
                }],
                "selector": {
                    APPLICATION_LABEL: APPLICATION_LABEL_VALUE,
                    CLUSTER_NAME_LABEL: self.identity.cluster_name(),
                    ROLE_LABEL: role,
                },
            },
        });
        Ok(serde_json::from_value(value)?)
    }
}
