//! Cluster-state reconciliation for a Patroni-managed PostgreSQL cluster
//!
//! Each member runs a [`controller::Member`] that reacts to lifecycle
//! events: the elected leader bootstraps credentials and networking
//! objects, every member evaluates its status on each tick, and callers
//! rotate passwords through [`actions::Actions`].
//!
//! External systems sit behind traits so the reconcilers can be driven
//! against mocks:
//!
//! - [`infra::InfraApi`] for Pods, Services and Endpoints
//! - [`ha::HaManager`] for the Patroni REST API
//! - [`supervisor::ProcessSupervisor`] for the workload's process manager
//! - [`database::UserAdmin`] for password changes inside PostgreSQL

#![deny(missing_docs)]

pub mod actions;
pub mod backup;
pub mod bootstrap;
pub mod controller;
pub mod database;
pub mod ha;
pub mod infra;
pub mod networking;
pub mod status;
pub mod supervisor;

pub use actions::{ActionError, Actions};
pub use bootstrap::{BootstrapOutcome, CredentialBootstrapper};
pub use controller::{Context, ContextBuilder, Event, Member, Outcome};
pub use networking::{InfraReconciler, RepairOutcome};
pub use status::{StatusReconciler, StatusState, UnitStatus};
