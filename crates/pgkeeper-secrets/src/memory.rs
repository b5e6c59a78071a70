//! In-process backends
//!
//! Used for local runs without a cluster and as test doubles for everything
//! layered on the secret store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use pgkeeper_common::{Error, Scope};

use crate::backend::{ConfidentialStore, PeerState, SecretContent};

/// Peer state held in a map
#[derive(Default)]
pub struct MemoryPeerState {
    data: Mutex<HashMap<Scope, BTreeMap<String, String>>>,
}

impl MemoryPeerState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one scope
    pub fn snapshot(&self, scope: Scope) -> BTreeMap<String, String> {
        self.data.lock().get(&scope).cloned().unwrap_or_default()
    }

    /// Seed a key
    pub fn seed(&self, scope: Scope, key: &str, value: &str) {
        self.data
            .lock()
            .entry(scope)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl PeerState for MemoryPeerState {
    async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, Error> {
        Ok(self
            .data
            .lock()
            .get(&scope)
            .and_then(|m| m.get(key).cloned()))
    }

    async fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), Error> {
        self.seed(scope, key, value);
        Ok(())
    }

    async fn delete(&self, scope: Scope, key: &str) -> Result<(), Error> {
        if let Some(m) = self.data.lock().get_mut(&scope) {
            m.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, scope: Scope) -> Result<(), Error> {
        self.data.lock().remove(&scope);
        Ok(())
    }
}

/// Confidential store held in a map, with an outage switch
#[derive(Default)]
pub struct MemoryConfidentialStore {
    bundles: Mutex<BTreeMap<String, SecretContent>>,
    outage: Mutex<Option<String>>,
}

impl MemoryConfidentialStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `message` until cleared with `None`
    pub fn set_outage(&self, message: Option<&str>) {
        *self.outage.lock() = message.map(str::to_string);
    }

    /// Snapshot of one bundle
    pub fn bundle(&self, label: &str) -> Option<SecretContent> {
        self.bundles.lock().get(label).cloned()
    }

    fn check(&self) -> Result<(), Error> {
        match self.outage.lock().as_deref() {
            Some(msg) => Err(Error::remote("confidential-store", msg)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConfidentialStore for MemoryConfidentialStore {
    async fn create(&self, label: &str, content: &SecretContent) -> Result<String, Error> {
        self.check()?;
        let mut bundles = self.bundles.lock();
        if bundles.contains_key(label) {
            return Err(Error::already_exists("Secret", label));
        }
        bundles.insert(label.to_string(), content.clone());
        Ok(label.to_string())
    }

    async fn get_content(&self, label: &str) -> Result<Option<SecretContent>, Error> {
        self.check()?;
        Ok(self.bundles.lock().get(label).cloned())
    }

    async fn set_content(&self, label: &str, content: &SecretContent) -> Result<(), Error> {
        self.check()?;
        match self.bundles.lock().get_mut(label) {
            Some(existing) => {
                *existing = content.clone();
                Ok(())
            }
            None => Err(Error::not_found("Secret", label)),
        }
    }

    async fn remove(&self, label: &str) -> Result<(), Error> {
        self.check()?;
        self.bundles.lock().remove(label);
        Ok(())
    }
}
