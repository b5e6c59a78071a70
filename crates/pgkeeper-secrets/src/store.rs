//! Secret store
//!
//! Secrets live either as plain keys in the peer state surface (legacy) or
//! inside one confidential bundle per scope (native), whose label is kept
//! under [`SECRET_ID_KEY`] in the peer state of that scope. Exactly one
//! representation is authoritative for a key at a time.
//!
//! When native storage is available, a key found only in legacy storage is
//! migrated on read: the value is written to the native bundle first and the
//! legacy copy is deleted second, so a crash in between leaves the legacy
//! copy as the source of truth and the next read retries the migration.
//!
//! Native storage being *available* is decided once, at construction. A
//! native store that is configured but failing is a hard error; there is no
//! silent fallback to legacy storage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use pgkeeper_common::{ClusterIdentity, Error, Result, Scope};

use crate::backend::{ConfidentialStore, PeerState, SecretContent};

/// Peer key holding the label of a scope's native bundle
pub const SECRET_ID_KEY: &str = "secret-id";

/// Secret lifecycle over the legacy and native backends
pub struct SecretStore {
    identity: ClusterIdentity,
    peers: Arc<dyn PeerState>,
    native: Option<Arc<dyn ConfidentialStore>>,
    cache: Mutex<HashMap<(Scope, String), String>>,
}

impl SecretStore {
    /// Store that prefers `native` and migrates legacy keys into it
    pub fn new(
        identity: ClusterIdentity,
        peers: Arc<dyn PeerState>,
        native: Arc<dyn ConfidentialStore>,
    ) -> Self {
        Self {
            identity,
            peers,
            native: Some(native),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Store for runtimes without native confidential storage
    pub fn legacy_only(identity: ClusterIdentity, peers: Arc<dyn PeerState>) -> Self {
        Self {
            identity,
            peers,
            native: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether secrets are written to the native store
    pub fn native_supported(&self) -> bool {
        self.native.is_some()
    }

    /// Read a secret, migrating it to native storage if it is only in legacy
    pub async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>> {
        check_key(scope, key)?;

        if let Some(value) = self.cached(scope, key) {
            return Ok(Some(value));
        }

        if let Some(native) = &self.native {
            let found = self
                .native_bundle(native.as_ref(), scope)
                .await?
                .and_then(|(_, content)| content.get(key).cloned());
            if let Some(value) = found {
                self.remember(scope, key, &value);
                return Ok(Some(value));
            }
        }

        let legacy = match self.peers.get(scope, key).await? {
            Some(v) if !v.is_empty() => v,
            _ => return Ok(None),
        };

        if let Some(native) = &self.native {
            self.write_native(native.as_ref(), scope, key, &legacy)
                .await?;
            self.peers.delete(scope, key).await?;
            info!(scope = %scope, key, "migrated secret from peer state to native storage");
        }

        self.remember(scope, key, &legacy);
        Ok(Some(legacy))
    }

    /// Write a secret; `None` or an empty string deletes it
    ///
    /// Returns the native bundle label when native storage holds the value.
    pub async fn set(&self, scope: Scope, key: &str, value: Option<&str>) -> Result<Option<String>> {
        check_key(scope, key)?;

        let Some(value) = value.filter(|v| !v.is_empty()) else {
            self.delete(scope, key).await?;
            return Ok(None);
        };

        self.forget(scope, key);

        let label = match &self.native {
            Some(native) => {
                let label = self
                    .write_native(native.as_ref(), scope, key, value)
                    .await?;
                if self.peers.get(scope, key).await?.is_some() {
                    self.peers.delete(scope, key).await?;
                }
                Some(label)
            }
            None => {
                self.peers.set(scope, key, value).await?;
                None
            }
        };

        self.remember(scope, key, value);
        debug!(scope = %scope, key, native = label.is_some(), "secret written");
        Ok(label)
    }

    /// Write a secret from an untyped value
    ///
    /// Strings are stored, `null` deletes, anything else is rejected.
    pub async fn set_value(&self, scope: Scope, key: &str, value: &Value) -> Result<Option<String>> {
        match value {
            Value::String(s) => self.set(scope, key, Some(s)).await,
            Value::Null => self.set(scope, key, None).await,
            other => Err(Error::validation_for(
                format!("{scope}:{key}"),
                format!("secret values must be text or null, got {}", json_kind(other)),
            )),
        }
    }

    /// Remove a secret
    ///
    /// Removing a secret that does not exist is not an error; it is logged
    /// as a warning so replays stay harmless.
    pub async fn remove(&self, scope: Scope, key: &str) -> Result<()> {
        check_key(scope, key)?;

        if !self.delete(scope, key).await? {
            warn!(
                scope = %scope,
                key,
                "Non-existing secret {}:{} was attempted to be removed.",
                scope,
                key
            );
        }
        Ok(())
    }

    /// Delete from whichever backend holds the key; true if anything was removed
    async fn delete(&self, scope: Scope, key: &str) -> Result<bool> {
        self.forget(scope, key);
        let mut removed = false;

        if let Some(native) = &self.native {
            if let Some((label, mut content)) = self.native_bundle(native.as_ref(), scope).await? {
                if content.remove(key).is_some() {
                    if content.is_empty() {
                        native.remove(&label).await?;
                        self.peers.delete(scope, SECRET_ID_KEY).await?;
                    } else {
                        native.set_content(&label, &content).await?;
                    }
                    removed = true;
                }
            }
        }

        if self.peers.get(scope, key).await?.is_some() {
            self.peers.delete(scope, key).await?;
            removed = true;
        }

        Ok(removed)
    }

    /// The scope's native bundle, if one is referenced and exists
    async fn native_bundle(
        &self,
        native: &dyn ConfidentialStore,
        scope: Scope,
    ) -> Result<Option<(String, SecretContent)>> {
        let Some(label) = self.peers.get(scope, SECRET_ID_KEY).await? else {
            return Ok(None);
        };
        Ok(native
            .get_content(&label)
            .await?
            .map(|content| (label, content)))
    }

    /// Put one key into the scope's native bundle, creating the bundle if needed
    async fn write_native(
        &self,
        native: &dyn ConfidentialStore,
        scope: Scope,
        key: &str,
        value: &str,
    ) -> Result<String> {
        if let Some((label, mut content)) = self.native_bundle(native, scope).await? {
            content.insert(key.to_string(), value.to_string());
            native.set_content(&label, &content).await?;
            return Ok(label);
        }

        let label = self.identity.secret_label(scope);
        let content = SecretContent::from([(key.to_string(), value.to_string())]);
        let label = match native.create(&label, &content).await {
            Ok(label) => label,
            Err(e) if e.is_already_exists() => {
                // A bundle without a peer reference, left by an interrupted
                // first write. Adopt it.
                let mut existing = native.get_content(&label).await?.unwrap_or_default();
                existing.insert(key.to_string(), value.to_string());
                native.set_content(&label, &existing).await?;
                label
            }
            Err(e) => return Err(e),
        };
        self.peers.set(scope, SECRET_ID_KEY, &label).await?;
        Ok(label)
    }

    fn cached(&self, scope: Scope, key: &str) -> Option<String> {
        self.cache.lock().get(&(scope, key.to_string())).cloned()
    }

    fn remember(&self, scope: Scope, key: &str, value: &str) {
        self.cache
            .lock()
            .insert((scope, key.to_string()), value.to_string());
    }

    fn forget(&self, scope: Scope, key: &str) {
        self.cache.lock().remove(&(scope, key.to_string()));
    }
}

fn check_key(scope: Scope, key: &str) -> Result<()> {
    if key.is_empty() || key == SECRET_ID_KEY {
        return Err(Error::validation_for(
            format!("{scope}:{key}"),
            "not a usable secret key",
        ));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
