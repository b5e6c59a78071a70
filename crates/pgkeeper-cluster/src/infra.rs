//! Infra API
//!
//! Narrow view of the Kubernetes API over the kinds the reconcilers touch. Objects travel as [`DynamicObject`] so one trait covers all of them
//! and tests can hand back arbitrary shapes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use pgkeeper_common::kube_utils::classify;
use pgkeeper_common::{Error, FIELD_MANAGER};

/// Object kinds the reconcilers read and write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Member compute identity
    Pod,
    /// Discovery service
    Service,
    /// Endpoints object the HA manager keeps its leader lock on
    Endpoints,
    /// Controller of the member Pods
    StatefulSet,
}

impl ResourceKind {
    /// Kind name as the API spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::Endpoints => "Endpoints",
            ResourceKind::StatefulSet => "StatefulSet",
        }
    }

    /// Type information for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::Endpoints => ApiResource::erase::<Endpoints>(&()),
            ResourceKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait abstracting the Kubernetes operations of the reconcilers
///
/// A missing object surfaces as [`Error::NotFound`] so callers can match on
/// [`Error::is_not_found`] instead of inspecting status codes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraApi: Send + Sync {
    /// Get an object by name
    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<DynamicObject, Error>;

    /// List objects matching a label selector
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Server-side apply a full object
    async fn apply(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<(), Error>;

    /// Merge-patch an object
    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        patch: &Value,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeInfra {
    client: Client,
}

impl KubeInfra {
    /// Create a new KubeInfra wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl InfraApi for KubeInfra {
    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<DynamicObject, Error> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| classify(kind.as_str(), name, e))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn apply(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<(), Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(kind, namespace)
            .patch(name, &params, &Patch::Apply(object))
            .await
            .map_err(|e| classify(kind.as_str(), name, e))?;
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.api(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(kind.as_str(), name, e))?;
        Ok(())
    }
}
