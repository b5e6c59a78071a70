//! Secret storage for pgkeeper
//!
//! [`SecretStore`] keeps credentials either in the legacy peer state or in
//! the native confidential store, migrating legacy keys as they are read.

#![deny(missing_docs)]

pub mod backend;
pub mod k8s;
pub mod memory;
pub mod store;

pub use backend::{ConfidentialStore, PeerState, SecretContent};
pub use k8s::{KubeConfidentialStore, KubePeerState};
pub use memory::{MemoryConfidentialStore, MemoryPeerState};
pub use store::{SecretStore, SECRET_ID_KEY};
