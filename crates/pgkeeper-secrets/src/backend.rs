//! Storage substrates the secret store sits on
//!
//! Both are remote collaborators. The peer state surface is a replicated
//! key/value space with last-writer-wins per key and no cross-key
//! transactions; the confidential store holds labelled bundles of values.

use std::collections::BTreeMap;

use async_trait::async_trait;

use pgkeeper_common::{Error, Scope};

/// Content of one confidential bundle
pub type SecretContent = BTreeMap<String, String>;

/// Replicated key/value space partitioned by scope
///
/// A missing key is `Ok(None)`, never an error.
#[async_trait]
pub trait PeerState: Send + Sync {
    /// Read a key
    async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, Error>;

    /// Write or overwrite a key
    async fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), Error>;

    /// Delete a key; deleting a missing key is a no-op
    async fn delete(&self, scope: Scope, key: &str) -> Result<(), Error>;

    /// Drop every key of a scope; an already empty scope is a no-op
    async fn clear(&self, scope: Scope) -> Result<(), Error>;
}

/// Runtime-provided store for confidential values
#[async_trait]
pub trait ConfidentialStore: Send + Sync {
    /// Create a bundle under `label` and return the stable label
    async fn create(&self, label: &str, content: &SecretContent) -> Result<String, Error>;

    /// Read a bundle; `None` if no bundle has that label
    async fn get_content(&self, label: &str) -> Result<Option<SecretContent>, Error>;

    /// Replace a bundle's content
    async fn set_content(&self, label: &str, content: &SecretContent) -> Result<(), Error>;

    /// Remove a bundle; removing a missing bundle is a no-op
    async fn remove(&self, label: &str) -> Result<(), Error>;
}
