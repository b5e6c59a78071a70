//! Common types for pgkeeper: errors, identity, configuration and utilities

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod identity;
pub mod kube_utils;
pub mod leader_election;
pub mod retry;
pub mod telemetry;
pub mod users;

pub use error::Error;
pub use identity::{ClusterIdentity, Scope};
pub use users::SystemUser;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application-scope key set once the cluster has been bootstrapped
pub const CLUSTER_INITIALISED_KEY: &str = "cluster_initialised";

/// Value written under [`CLUSTER_INITIALISED_KEY`]
pub const CLUSTER_INITIALISED_VALUE: &str = "True";

/// Application-scope key holding the timestamp of an in-flight restore
pub const RESTORING_BACKUP_KEY: &str = "restoring-backup";

/// Annotation on the cluster Endpoints naming the designated leader
pub const LEADER_ANNOTATION: &str = "leader";

/// Label marking networking objects created for an application
pub const CREATED_BY_LABEL: &str = "pgkeeper.io/created-by";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "pgkeeper";
