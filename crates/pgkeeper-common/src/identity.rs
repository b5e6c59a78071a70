//! Cluster and member identity
//!
//! Every name the reconcilers touch is derived from the application name and
//! the member's ordinal, so all members agree on them without coordination.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Partition under which a secret or shared state key lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Shared by every member of the application
    Application,
    /// Private to one member
    Member,
}

impl Scope {
    /// Both scopes, application first
    pub const ALL: [Scope; 2] = [Scope::Application, Scope::Member];

    /// Short wire name (`app` / `unit`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Application => "app",
            Scope::Member => "unit",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" | "application" => Ok(Scope::Application),
            "unit" | "member" => Ok(Scope::Member),
            other => Err(Error::validation_for(
                "scope",
                format!("unknown scope '{other}', expected 'app' or 'unit'"),
            )),
        }
    }
}

/// Deterministic identity of this member within its cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIdentity {
    app_name: String,
    namespace: String,
    ordinal: u32,
}

impl ClusterIdentity {
    /// Build an identity from its parts
    pub fn new(app_name: impl Into<String>, namespace: impl Into<String>, ordinal: u32) -> Self {
        Self {
            app_name: app_name.into(),
            namespace: namespace.into(),
            ordinal,
        }
    }

    /// Parse the ordinal out of a StatefulSet pod name (`<app>-<ordinal>`)
    pub fn from_pod_name(
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        pod_name: &str,
    ) -> Result<Self, Error> {
        let app_name = app_name.into();
        let ordinal = pod_name
            .strip_prefix(&app_name)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::validation_for(
                    "pod-name",
                    format!("'{pod_name}' is not a member of application '{app_name}'"),
                )
            })?;
        Ok(Self::new(app_name, namespace, ordinal))
    }

    /// Application name
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Namespace all cluster objects live in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Ordinal of this member
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Name the HA manager knows this cluster by
    pub fn cluster_name(&self) -> String {
        format!("patroni-{}", self.app_name)
    }

    /// Name of this member (also its pod name)
    pub fn member_name(&self) -> String {
        self.member_name_for(self.ordinal)
    }

    /// Name of the member with the given ordinal
    pub fn member_name_for(&self, ordinal: u32) -> String {
        format!("{}-{}", self.app_name, ordinal)
    }

    /// The first member; its controller owns the shared networking objects
    pub fn first_member_name(&self) -> String {
        self.member_name_for(0)
    }

    /// Service routing to the current primary
    pub fn primary_service_name(&self) -> String {
        format!("{}-primary", self.app_name)
    }

    /// Service routing to the replicas
    pub fn replicas_service_name(&self) -> String {
        format!("{}-replicas", self.app_name)
    }

    /// Label of the native secret bundle for a scope
    pub fn secret_label(&self, scope: Scope) -> String {
        match scope {
            Scope::Application => format!("{}.{}", self.app_name, scope),
            Scope::Member => format!("{}.{}.{}", self.app_name, scope, self.member_name()),
        }
    }
}
