//! Kubernetes-backed storage
//!
//! Peer state lives in ConfigMaps: `{app}-peers` for the application scope
//! and `{app}-peers-{member}` for this member's scope. Confidential bundles
//! are Secrets named by their label.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

use pgkeeper_common::kube_utils::classify;
use pgkeeper_common::{ClusterIdentity, Error, Scope, CREATED_BY_LABEL};

use crate::backend::{ConfidentialStore, PeerState, SecretContent};

/// Peer state stored in ConfigMaps
pub struct KubePeerState {
    api: Api<ConfigMap>,
    identity: ClusterIdentity,
}

impl KubePeerState {
    /// Peer state for `identity` in its namespace
    pub fn new(client: Client, identity: ClusterIdentity) -> Self {
        Self {
            api: Api::namespaced(client, identity.namespace()),
            identity,
        }
    }

    fn config_map_name(&self, scope: Scope) -> String {
        match scope {
            Scope::Application => format!("{}-peers", self.identity.app_name()),
            Scope::Member => format!(
                "{}-peers-{}",
                self.identity.app_name(),
                self.identity.member_name()
            ),
        }
    }

    async fn read(&self, scope: Scope) -> Result<Option<BTreeMap<String, String>>, Error> {
        let name = self.config_map_name(scope);
        match self.api.get(&name).await {
            Ok(cm) => Ok(Some(cm.data.unwrap_or_default())),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(classify("ConfigMap", &name, e)),
        }
    }

    async fn merge(&self, name: &str, patch: &serde_json::Value) -> Result<(), Error> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify("ConfigMap", name, e))?;
        Ok(())
    }
}

#[async_trait]
impl PeerState for KubePeerState {
    async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, Error> {
        Ok(self.read(scope).await?.and_then(|mut data| data.remove(key)))
    }

    async fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), Error> {
        let name = self.config_map_name(scope);
        let patch = json!({ "data": { key: value } });
        match self.merge(&name, &patch).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {}
        }

        debug!(config_map = %name, "creating peer state");
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.identity.namespace().to_string()),
                labels: Some(BTreeMap::from([(
                    CREATED_BY_LABEL.to_string(),
                    self.identity.app_name().to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            // Another member created it first
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(config_map = %name, "peer state created concurrently, patching");
                self.merge(&name, &patch).await
            }
            Err(e) => Err(classify("ConfigMap", &name, e)),
        }
    }

    async fn delete(&self, scope: Scope, key: &str) -> Result<(), Error> {
        let name = self.config_map_name(scope);
        let patch = json!({ "data": { key: null } });
        match self
            .api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(classify("ConfigMap", &name, e)),
        }
    }

    async fn clear(&self, scope: Scope) -> Result<(), Error> {
        let name = self.config_map_name(scope);
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(config_map = %name, "peer state removed");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(classify("ConfigMap", &name, e)),
        }
    }
}

/// Confidential bundles stored as Secrets
pub struct KubeConfidentialStore {
    api: Api<Secret>,
    app_name: String,
}

impl KubeConfidentialStore {
    /// Store in the namespace of `identity`
    pub fn new(client: Client, identity: &ClusterIdentity) -> Self {
        Self {
            api: Api::namespaced(client, identity.namespace()),
            app_name: identity.app_name().to_string(),
        }
    }
}

fn decode(secret: Secret) -> SecretContent {
    let name = secret.metadata.name.unwrap_or_default();
    let mut content: SecretContent = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match String::from_utf8(v.0) {
            Ok(v) => Some((k, v)),
            Err(_) => {
                warn!(secret = %name, key = %k, "ignoring secret value that is not valid UTF-8");
                None
            }
        })
        .collect();
    // stringData is write-only on the server, but appears on objects we built
    if let Some(string_data) = secret.string_data {
        content.extend(string_data);
    }
    content
}

fn encode(content: &SecretContent) -> BTreeMap<String, ByteString> {
    content
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

#[async_trait]
impl ConfidentialStore for KubeConfidentialStore {
    async fn create(&self, label: &str, content: &SecretContent) -> Result<String, Error> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(label.to_string()),
                labels: Some(BTreeMap::from([(
                    CREATED_BY_LABEL.to_string(),
                    self.app_name.clone(),
                )])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(content.clone()),
            ..Default::default()
        };
        let created = self
            .api
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| classify("Secret", label, e))?;
        Ok(created.metadata.name.unwrap_or_else(|| label.to_string()))
    }

    async fn get_content(&self, label: &str) -> Result<Option<SecretContent>, Error> {
        match self.api.get(label).await {
            Ok(secret) => Ok(Some(decode(secret))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(classify("Secret", label, e)),
        }
    }

    async fn set_content(&self, label: &str, content: &SecretContent) -> Result<(), Error> {
        let mut secret = self
            .api
            .get(label)
            .await
            .map_err(|e| classify("Secret", label, e))?;
        secret.data = Some(encode(content));
        secret.string_data = None;
        self.api
            .replace(label, &PostParams::default(), &secret)
            .await
            .map_err(|e| classify("Secret", label, e))?;
        Ok(())
    }

    async fn remove(&self, label: &str) -> Result<(), Error> {
        match self.api.delete(label, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(classify("Secret", label, e)),
        }
    }
}
