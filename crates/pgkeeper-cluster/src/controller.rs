//! Member controller
//!
//! Dispatches lifecycle events to the reconcilers and owns the member's
//! visible status. Events are handled one at a time to completion; the
//! runtime loop decides when to deliver the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::{debug, error, info, instrument};

use pgkeeper_common::retry::RetryConfig;
use pgkeeper_common::{ClusterIdentity, Error, Scope};
use pgkeeper_secrets::{KubeConfidentialStore, KubePeerState, PeerState, SecretStore};

use crate::actions::Actions;
use crate::backup::{NoRepository, RepositoryValidator};
use crate::bootstrap::CredentialBootstrapper;
use crate::database::{PostgresUserAdmin, UserAdmin};
use crate::ha::{HaManager, PatroniClient, RenderParams, DEFAULT_HA_URL};
use crate::infra::{InfraApi, KubeInfra};
use crate::networking::{InfraReconciler, DATABASE_PORT};
use crate::status::{
    PodAnnotationSink, StatusReconciler, StatusSink, UnitStatus, SUPERVISOR_UNREACHABLE_MESSAGE,
};
use crate::supervisor::{HttpSupervisor, ProcessSupervisor, DEFAULT_SUPERVISOR_URL};

/// Timeout for requests to the local HA manager and supervisor
pub const LOCAL_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Message when Service creation fails
pub const SERVICES_FAILED_MESSAGE: &str = "failed to create services";

/// Message when the member Pod cannot be labelled
pub const LABELS_FAILED_MESSAGE: &str = "failed to patch pod with labels";

/// Message while the cluster has not been bootstrapped
pub const AWAITING_CLUSTER_MESSAGE: &str = "awaiting for cluster to start";

/// Message while this member's database is starting
pub const AWAITING_MEMBER_MESSAGE: &str = "awaiting for member to start";

/// Lifecycle events a member reacts to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// This member acquired leadership
    LeaderElected,
    /// Periodic status tick
    UpdateStatus,
    /// The workload container's supervisor came up
    WorkloadReady,
    /// The operator binary was upgraded
    Upgrade,
    /// This member is being removed
    Stop,
}

/// Whether an event needs to be delivered again later
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Fully handled
    Done,
    /// Preconditions not met yet; deliver again on a later tick
    Retry,
}

/// Collaborators shared by every handler
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(identity)
///     .client(client)
///     .ha_url("http://localhost:8008")
///     .build()?;
/// ```
pub struct Context {
    /// Who this member is
    pub identity: ClusterIdentity,
    /// Replicated peer state
    pub peers: Arc<dyn PeerState>,
    /// Secret store
    pub secrets: Arc<SecretStore>,
    /// Kubernetes operations
    pub infra: Arc<dyn InfraApi>,
    /// HA manager
    pub ha: Arc<dyn HaManager>,
    /// Local process supervisor
    pub supervisor: Arc<dyn ProcessSupervisor>,
    /// Backup repository validation
    pub repository: Arc<dyn RepositoryValidator>,
    /// Database user administration
    pub users: Arc<dyn UserAdmin>,
    /// Status publication
    pub status_sink: Arc<dyn StatusSink>,
    /// Configuration pushed to the HA manager on re-render
    pub render: RenderParams,
    /// Retry budget for leadership lookups
    pub leadership_retry: RetryConfig,
    /// Set while this member holds the leader lease
    pub leader: Arc<AtomicBool>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(identity: ClusterIdentity) -> ContextBuilder {
        ContextBuilder::new(identity)
    }

    /// Whether this member currently holds leadership
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Action handlers backed by this context
    pub fn actions(&self) -> Actions {
        Actions::new(
            self.secrets.clone(),
            self.ha.clone(),
            self.users.clone(),
            self.render.clone(),
            self.leadership_retry.clone(),
        )
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every collaborator not set explicitly is built from the Kubernetes client
/// and the configured URLs; building fails if one is needed and no client
/// was given.
pub struct ContextBuilder {
    identity: ClusterIdentity,
    client: Option<Client>,
    legacy_secrets: bool,
    ha_url: String,
    supervisor_url: String,
    database_host: Option<String>,
    peers: Option<Arc<dyn PeerState>>,
    secrets: Option<Arc<SecretStore>>,
    infra: Option<Arc<dyn InfraApi>>,
    ha: Option<Arc<dyn HaManager>>,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    repository: Option<Arc<dyn RepositoryValidator>>,
    users: Option<Arc<dyn UserAdmin>>,
    status_sink: Option<Arc<dyn StatusSink>>,
    render: RenderParams,
    leadership_retry: RetryConfig,
    leader: Option<Arc<AtomicBool>>,
}

impl ContextBuilder {
    fn new(identity: ClusterIdentity) -> Self {
        Self {
            identity,
            client: None,
            legacy_secrets: false,
            ha_url: DEFAULT_HA_URL.to_string(),
            supervisor_url: DEFAULT_SUPERVISOR_URL.to_string(),
            database_host: None,
            peers: None,
            secrets: None,
            infra: None,
            ha: None,
            supervisor: None,
            repository: None,
            users: None,
            status_sink: None,
            render: RenderParams::default(),
            leadership_retry: RetryConfig::leadership_query(),
            leader: None,
        }
    }

    /// Kubernetes client for the default collaborators
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Keep secrets in peer state only
    pub fn legacy_secrets(mut self, legacy: bool) -> Self {
        self.legacy_secrets = legacy;
        self
    }

    /// HA manager REST API address
    pub fn ha_url(mut self, url: impl Into<String>) -> Self {
        self.ha_url = url.into();
        self
    }

    /// Supervisor API address
    pub fn supervisor_url(mut self, url: impl Into<String>) -> Self {
        self.supervisor_url = url.into();
        self
    }

    /// Host password changes connect to (defaults to the primary Service)
    pub fn database_host(mut self, host: impl Into<String>) -> Self {
        self.database_host = Some(host.into());
        self
    }

    /// Override the peer state (primarily for testing)
    pub fn peers(mut self, peers: Arc<dyn PeerState>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Override the secret store (primarily for testing)
    pub fn secrets(mut self, secrets: Arc<SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Override the Kubernetes operations (primarily for testing)
    pub fn infra(mut self, infra: Arc<dyn InfraApi>) -> Self {
        self.infra = Some(infra);
        self
    }

    /// Override the HA manager (primarily for testing)
    pub fn ha(mut self, ha: Arc<dyn HaManager>) -> Self {
        self.ha = Some(ha);
        self
    }

    /// Override the supervisor (primarily for testing)
    pub fn supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the backup repository validator
    pub fn repository(mut self, repository: Arc<dyn RepositoryValidator>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Override the database user admin (primarily for testing)
    pub fn users(mut self, users: Arc<dyn UserAdmin>) -> Self {
        self.users = Some(users);
        self
    }

    /// Override the status sink (primarily for testing)
    pub fn status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Configuration pushed to the HA manager on re-render
    pub fn render(mut self, render: RenderParams) -> Self {
        self.render = render;
        self
    }

    /// Retry budget for leadership lookups
    pub fn leadership_retry(mut self, retry: RetryConfig) -> Self {
        self.leadership_retry = retry;
        self
    }

    /// Share a leader flag maintained elsewhere (the lease elector)
    pub fn leader_flag(mut self, leader: Arc<AtomicBool>) -> Self {
        self.leader = Some(leader);
        self
    }

    fn require_client(&self, what: &str) -> Result<Client, Error> {
        self.client.clone().ok_or_else(|| {
            Error::internal_with_context("context", format!("no kubernetes client for {what}"))
        })
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let identity = self.identity.clone();

        let infra: Arc<dyn InfraApi> = match &self.infra {
            Some(infra) => infra.clone(),
            None => Arc::new(KubeInfra::new(self.require_client("infra")?)),
        };

        let peers: Arc<dyn PeerState> = match &self.peers {
            Some(peers) => peers.clone(),
            None => Arc::new(KubePeerState::new(
                self.require_client("peer state")?,
                identity.clone(),
            )),
        };

        let secrets = match &self.secrets {
            Some(secrets) => secrets.clone(),
            None if self.legacy_secrets => {
                Arc::new(SecretStore::legacy_only(identity.clone(), peers.clone()))
            }
            None => Arc::new(SecretStore::new(
                identity.clone(),
                peers.clone(),
                Arc::new(KubeConfidentialStore::new(
                    self.require_client("secrets")?,
                    &identity,
                )),
            )),
        };

        let ha: Arc<dyn HaManager> = match self.ha {
            Some(ha) => ha,
            None => Arc::new(PatroniClient::new(&self.ha_url, LOCAL_API_TIMEOUT)?),
        };

        let supervisor: Arc<dyn ProcessSupervisor> = match self.supervisor {
            Some(supervisor) => supervisor,
            None => Arc::new(HttpSupervisor::new(&self.supervisor_url, LOCAL_API_TIMEOUT)?),
        };

        let users: Arc<dyn UserAdmin> = match self.users {
            Some(users) => users,
            None => {
                let host = self.database_host.unwrap_or_else(|| {
                    format!(
                        "{}.{}.svc",
                        identity.primary_service_name(),
                        identity.namespace()
                    )
                });
                Arc::new(PostgresUserAdmin::new(host, DATABASE_PORT, secrets.clone()))
            }
        };

        let status_sink: Arc<dyn StatusSink> = match self.status_sink {
            Some(sink) => sink,
            None => Arc::new(PodAnnotationSink::new(infra.clone(), identity.clone())),
        };

        Ok(Context {
            identity,
            peers,
            secrets,
            infra,
            ha,
            supervisor,
            repository: self.repository.unwrap_or_else(|| Arc::new(NoRepository)),
            users,
            status_sink,
            render: self.render,
            leadership_retry: self.leadership_retry,
            leader: self.leader.unwrap_or_default(),
        })
    }
}

/// One member's event handler and status holder
pub struct Member {
    ctx: Arc<Context>,
    infra: Arc<InfraReconciler>,
    bootstrap: CredentialBootstrapper,
    status: StatusReconciler,
    current: UnitStatus,
    published: bool,
}

impl Member {
    /// Wire the reconcilers over `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        let infra = Arc::new(InfraReconciler::new(ctx.infra.clone(), ctx.identity.clone()));
        let bootstrap =
            CredentialBootstrapper::new(ctx.peers.clone(), ctx.secrets.clone(), infra.clone());
        let status = StatusReconciler::new(
            ctx.identity.clone(),
            ctx.peers.clone(),
            ctx.supervisor.clone(),
            ctx.ha.clone(),
            ctx.repository.clone(),
            ctx.render.clone(),
            ctx.leadership_retry.clone(),
        );
        Self {
            ctx,
            infra,
            bootstrap,
            status,
            current: UnitStatus::default(),
            published: false,
        }
    }

    /// Status as last evaluated
    pub fn status(&self) -> &UnitStatus {
        &self.current
    }

    /// Handle one event to completion
    #[instrument(skip(self), fields(member = %self.ctx.identity.member_name()))]
    pub async fn handle(&mut self, event: Event) -> Result<Outcome, Error> {
        debug!("handling event");
        match event {
            Event::LeaderElected => self.on_leader_elected().await,
            Event::UpdateStatus => {
                let next = self.status.update_status(&self.current).await?;
                self.set_status(next).await?;
                Ok(Outcome::Done)
            }
            Event::WorkloadReady => self.on_workload_ready().await,
            Event::Upgrade => self.on_upgrade().await,
            Event::Stop => {
                self.infra.teardown().await;
                self.forget_member_state_on_scale_to_zero().await;
                Ok(Outcome::Done)
            }
        }
    }

    async fn on_leader_elected(&mut self) -> Result<Outcome, Error> {
        if !self.ctx.is_leader() {
            debug!("leadership lost before the election event ran");
            return Ok(Outcome::Done);
        }
        let outcome = self.bootstrap.on_leader_elected().await?;
        info!(outcome = ?outcome, "leader election handled");
        Ok(Outcome::Done)
    }

    async fn on_workload_ready(&mut self) -> Result<Outcome, Error> {
        if !self.ctx.supervisor.is_reachable().await {
            self.set_status(UnitStatus::maintenance(SUPERVISOR_UNREACHABLE_MESSAGE))
                .await?;
            return Ok(Outcome::Retry);
        }

        if self.ctx.is_leader() {
            if let Err(e) = self.infra.ensure_services().await {
                error!(error = %e, "failed to create services");
                self.set_status(UnitStatus::blocked(SERVICES_FAILED_MESSAGE))
                    .await?;
                return Ok(Outcome::Done);
            }
        }

        if let Err(e) = self.infra.patch_member_labels().await {
            error!(error = %e, "failed to patch pod with labels");
            self.set_status(UnitStatus::blocked(LABELS_FAILED_MESSAGE))
                .await?;
            return Ok(Outcome::Done);
        }

        if !self.bootstrap.is_initialised().await? {
            self.set_status(UnitStatus::waiting(AWAITING_CLUSTER_MESSAGE))
                .await?;
            return Ok(Outcome::Retry);
        }

        if !self.ctx.ha.is_member_started().await {
            self.set_status(UnitStatus::waiting(AWAITING_MEMBER_MESSAGE))
                .await?;
            return Ok(Outcome::Retry);
        }

        let next = self.status.update_status(&UnitStatus::active("")).await?;
        self.set_status(next).await?;
        Ok(Outcome::Done)
    }

    async fn on_upgrade(&mut self) -> Result<Outcome, Error> {
        if let Err(e) = self.infra.ensure_services().await {
            error!(error = %e, "failed to create services after upgrade");
            self.set_status(UnitStatus::blocked(SERVICES_FAILED_MESSAGE))
                .await?;
            return Ok(Outcome::Done);
        }
        if let Err(e) = self.infra.patch_member_labels().await {
            error!(error = %e, "failed to patch pod with labels after upgrade");
            self.set_status(UnitStatus::blocked(LABELS_FAILED_MESSAGE))
                .await?;
        }
        Ok(Outcome::Done)
    }

    /// Drop this member's peer state when the whole application goes away
    ///
    /// A redeployment must not pick up data from before the scale to zero.
    /// Like the teardown, nothing here may block the removal.
    async fn forget_member_state_on_scale_to_zero(&self) {
        match self.infra.desired_replicas().await {
            Ok(Some(replicas)) if replicas > 0 => {
                debug!(replicas, "application keeps running, member state kept");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "failed to read desired replicas, member state kept");
                return;
            }
        }
        match self.ctx.peers.clear(Scope::Member).await {
            Ok(()) => info!("application scaled to zero, member peer state cleared"),
            Err(e) => error!(error = %e, "failed to clear member peer state"),
        }
    }

    async fn set_status(&mut self, status: UnitStatus) -> Result<(), Error> {
        if self.published && status == self.current {
            return Ok(());
        }
        self.ctx.status_sink.publish(&status).await?;
        info!(status = %status, "status changed");
        self.current = status;
        self.published = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{MockRepositoryValidator, RepositoryCheck};
    use crate::database::MockUserAdmin;
    use crate::ha::MockHaManager;
    use crate::infra::{MockInfraApi, ResourceKind};
    use crate::status::{MockStatusSink, StatusState, PRIMARY_MESSAGE};
    use crate::supervisor::{MockProcessSupervisor, ServiceState, ServiceStatus, DATABASE_SERVICE};
    use kube::api::DynamicObject;
    use pgkeeper_common::{Scope, CLUSTER_INITIALISED_KEY, CLUSTER_INITIALISED_VALUE};
    use pgkeeper_secrets::{MemoryConfidentialStore, MemoryPeerState};
    use serde_json::json;

    fn identity() -> ClusterIdentity {
        ClusterIdentity::new("postgresql-k8s", "db", 0)
    }

    fn pod(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "db" },
        }))
        .unwrap()
    }

    fn endpoints(leader: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {
                "name": "patroni-postgresql-k8s",
                "namespace": "db",
                "annotations": { "leader": leader },
            },
        }))
        .unwrap()
    }

    fn statefulset(replicas: i64) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "postgresql-k8s", "namespace": "db" },
            "spec": { "replicas": replicas },
        }))
        .unwrap()
    }

    fn api_failure() -> Error {
        Error::remote_permanent("kubernetes", "fake api error")
    }

    struct Mocks {
        infra: MockInfraApi,
        ha: MockHaManager,
        supervisor: MockProcessSupervisor,
        repository: MockRepositoryValidator,
        sink: MockStatusSink,
    }

    impl Mocks {
        fn new() -> Self {
            let mut sink = MockStatusSink::new();
            sink.expect_publish().returning(|_| Ok(()));
            Self {
                infra: MockInfraApi::new(),
                ha: MockHaManager::new(),
                supervisor: MockProcessSupervisor::new(),
                repository: MockRepositoryValidator::new(),
                sink,
            }
        }

        fn member(self, peers: Arc<MemoryPeerState>, leader: bool) -> Member {
            let secrets = Arc::new(SecretStore::new(
                identity(),
                peers.clone(),
                Arc::new(MemoryConfidentialStore::new()),
            ));
            let ctx = Context::builder(identity())
                .peers(peers)
                .secrets(secrets)
                .infra(Arc::new(self.infra))
                .ha(Arc::new(self.ha))
                .supervisor(Arc::new(self.supervisor))
                .repository(Arc::new(self.repository))
                .users(Arc::new(MockUserAdmin::new()))
                .status_sink(Arc::new(self.sink))
                .leadership_retry(RetryConfig::immediate(2))
                .leader_flag(Arc::new(AtomicBool::new(leader)))
                .build()
                .unwrap();
            Member::new(Arc::new(ctx))
        }
    }

    fn initialised_peers() -> Arc<MemoryPeerState> {
        let peers = Arc::new(MemoryPeerState::new());
        peers.seed(Scope::Application, CLUSTER_INITIALISED_KEY, CLUSTER_INITIALISED_VALUE);
        peers
    }

    #[test]
    fn test_build_without_client_needs_every_kube_collaborator() {
        let err = Context::builder(identity()).build().err().unwrap();
        assert!(err.to_string().contains("no kubernetes client"));
    }

    // ==========================================================================
    // Story: workload becomes ready
    // ==========================================================================

    #[tokio::test]
    async fn story_workload_ready_without_supervisor_retries_in_maintenance() {
        let mut m = Mocks::new();
        m.supervisor.expect_is_reachable().returning(|| false);
        m.infra.expect_patch().times(0);
        let mut member = m.member(initialised_peers(), true);

        assert_eq!(member.handle(Event::WorkloadReady).await.unwrap(), Outcome::Retry);
        assert_eq!(member.status().state, StatusState::Maintenance);
    }

    #[tokio::test]
    async fn story_leader_blocks_when_services_cannot_be_created() {
        let mut m = Mocks::new();
        m.supervisor.expect_is_reachable().returning(|| true);
        m.infra.expect_get().returning(|_, _, _| Err(api_failure()));
        m.infra.expect_patch().times(0);
        let mut member = m.member(initialised_peers(), true);

        assert_eq!(member.handle(Event::WorkloadReady).await.unwrap(), Outcome::Done);
        assert_eq!(member.status(), &UnitStatus::blocked(SERVICES_FAILED_MESSAGE));
    }

    #[tokio::test]
    async fn story_replica_waits_for_cluster_bootstrap() {
        let mut m = Mocks::new();
        m.supervisor.expect_is_reachable().returning(|| true);
        m.infra.expect_patch().times(1).returning(|_, _, _, _| Ok(()));
        m.infra.expect_apply().times(0);
        let mut member = m.member(Arc::new(MemoryPeerState::new()), false);

        assert_eq!(member.handle(Event::WorkloadReady).await.unwrap(), Outcome::Retry);
        assert_eq!(member.status(), &UnitStatus::waiting(AWAITING_CLUSTER_MESSAGE));
    }

    #[tokio::test]
    async fn story_started_member_becomes_active() {
        let mut m = Mocks::new();
        m.supervisor.expect_is_reachable().returning(|| true);
        m.supervisor.expect_get_service_statuses().returning(|| {
            Ok(vec![ServiceStatus {
                name: DATABASE_SERVICE.to_string(),
                current: ServiceState::Active,
            }])
        });
        m.infra.expect_patch().returning(|_, _, _, _| Ok(()));
        m.ha.expect_is_member_started().returning(|| true);
        m.ha.expect_get_primary()
            .returning(|| Ok("postgresql-k8s-0".to_string()));
        m.repository
            .expect_can_use_repository()
            .returning(|| Ok(RepositoryCheck::Usable));
        let mut member = m.member(initialised_peers(), false);

        assert_eq!(member.handle(Event::WorkloadReady).await.unwrap(), Outcome::Done);
        assert_eq!(member.status(), &UnitStatus::active(PRIMARY_MESSAGE));
    }

    #[tokio::test]
    async fn story_replica_waits_for_its_database_to_start() {
        let mut m = Mocks::new();
        m.supervisor.expect_is_reachable().returning(|| true);
        m.supervisor.expect_get_service_statuses().times(0);
        m.infra.expect_patch().times(1).returning(|_, _, _, _| Ok(()));
        m.ha.expect_is_member_started().times(1).returning(|| false);
        let mut member = m.member(initialised_peers(), false);

        assert_eq!(member.handle(Event::WorkloadReady).await.unwrap(), Outcome::Retry);
        assert_eq!(member.status(), &UnitStatus::waiting(AWAITING_MEMBER_MESSAGE));
        assert_eq!(member.status().state, StatusState::Waiting);
    }

    // ==========================================================================
    // Story: upgrade
    // ==========================================================================

    #[tokio::test]
    async fn story_upgrade_stops_at_first_failure() {
        // Services fail: labels are not attempted
        let mut m = Mocks::new();
        m.infra.expect_get().returning(|_, _, _| Err(api_failure()));
        m.infra.expect_patch().times(0);
        let mut member = m.member(initialised_peers(), false);
        member.handle(Event::Upgrade).await.unwrap();
        assert_eq!(member.status(), &UnitStatus::blocked(SERVICES_FAILED_MESSAGE));

        // Services succeed, labels fail
        let mut m = Mocks::new();
        m.infra.expect_get().returning(|_, name, _| Ok(pod(name)));
        m.infra.expect_apply().times(2).returning(|_, _, _, _| Ok(()));
        m.infra
            .expect_patch()
            .withf(|kind, _, _, _| *kind == ResourceKind::Pod)
            .times(1)
            .returning(|_, _, _, _| Err(api_failure()));
        let mut member = m.member(initialised_peers(), false);
        member.handle(Event::Upgrade).await.unwrap();
        assert_eq!(member.status(), &UnitStatus::blocked(LABELS_FAILED_MESSAGE));

        // Both succeed
        let mut m = Mocks::new();
        m.infra.expect_get().returning(|_, name, _| Ok(pod(name)));
        m.infra.expect_apply().times(2).returning(|_, _, _, _| Ok(()));
        m.infra.expect_patch().times(1).returning(|_, _, _, _| Ok(()));
        let mut member = m.member(initialised_peers(), false);
        member.handle(Event::Upgrade).await.unwrap();
        assert_ne!(member.status().state, StatusState::Blocked);
    }

    // ==========================================================================
    // Story: leadership and status publication
    // ==========================================================================

    #[tokio::test]
    async fn story_stale_election_event_is_ignored() {
        let m = Mocks::new();
        // No infra expectations: any call would panic
        let mut member = m.member(Arc::new(MemoryPeerState::new()), false);
        assert_eq!(member.handle(Event::LeaderElected).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn story_first_leader_bootstraps_the_cluster() {
        let mut m = Mocks::new();
        m.infra
            .expect_get()
            .withf(|kind, _, _| *kind == ResourceKind::Pod)
            .returning(|_, name, _| Ok(pod(name)));
        m.infra
            .expect_get()
            .withf(|kind, _, _| *kind == ResourceKind::Endpoints)
            .returning(|_, _, _| Ok(endpoints("postgresql-k8s-0")));
        m.infra.expect_apply().times(2).returning(|_, _, _, _| Ok(()));
        m.infra.expect_patch().times(0);
        let peers = Arc::new(MemoryPeerState::new());
        let mut member = m.member(peers.clone(), true);

        assert_eq!(member.handle(Event::LeaderElected).await.unwrap(), Outcome::Done);
        assert_eq!(
            peers
                .get(Scope::Application, CLUSTER_INITIALISED_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some(CLUSTER_INITIALISED_VALUE)
        );
        let operator = member
            .ctx
            .actions()
            .get_password(None)
            .await
            .unwrap();
        assert_eq!(operator.len(), 16);
    }

    #[tokio::test]
    async fn story_status_tick_fails_when_supervisor_cannot_list_services() {
        let mut m = Mocks::new();
        m.sink = MockStatusSink::new();
        m.sink.expect_publish().times(0);
        m.supervisor.expect_is_reachable().returning(|| true);
        m.supervisor
            .expect_get_service_statuses()
            .times(1)
            .returning(|| Err(Error::remote("supervisor", "connection reset")));
        // No HA expectations: any call would panic
        let mut member = m.member(initialised_peers(), false);

        assert!(member.handle(Event::UpdateStatus).await.is_err());
        assert_eq!(member.status(), &UnitStatus::default());
    }

    #[tokio::test]
    async fn story_status_is_published_only_on_change() {
        let mut m = Mocks::new();
        m.sink = MockStatusSink::new();
        m.sink.expect_publish().times(1).returning(|_| Ok(()));
        m.supervisor.expect_is_reachable().returning(|| false);
        let mut member = m.member(initialised_peers(), false);

        member.handle(Event::UpdateStatus).await.unwrap();
        member.handle(Event::UpdateStatus).await.unwrap();
        assert_eq!(
            member.status(),
            &UnitStatus::maintenance(SUPERVISOR_UNREACHABLE_MESSAGE)
        );
    }

    // ==========================================================================
    // Story: member removal
    // ==========================================================================

    /// Peers holding this member's state next to the cluster flag
    fn peers_with_member_state() -> Arc<MemoryPeerState> {
        let peers = initialised_peers();
        peers.seed(Scope::Member, "operator-version", "0.1.0");
        peers
    }

    async fn member_state(peers: &MemoryPeerState) -> Option<String> {
        peers.get(Scope::Member, "operator-version").await.unwrap()
    }

    /// Infra whose teardown gives up early and whose StatefulSet answers `set`
    fn removal_infra(
        set: impl Fn() -> Result<DynamicObject, Error> + Send + 'static,
    ) -> MockInfraApi {
        let mut infra = MockInfraApi::new();
        infra
            .expect_get()
            .withf(|kind, _, _| *kind == ResourceKind::StatefulSet)
            .times(1)
            .returning(move |_, _, _| set());
        infra
            .expect_get()
            .withf(|kind, _, _| *kind == ResourceKind::Pod)
            .returning(|_, _, _| Err(api_failure()));
        infra
    }

    #[tokio::test]
    async fn story_stop_hands_objects_over_without_failing() {
        let mut m = Mocks::new();
        m.infra.expect_get().returning(|_, _, _| Err(api_failure()));
        let peers = peers_with_member_state();
        let mut member = m.member(peers.clone(), false);

        assert_eq!(member.handle(Event::Stop).await.unwrap(), Outcome::Done);
        assert!(member_state(&peers).await.is_some());
    }

    #[tokio::test]
    async fn story_scale_to_zero_clears_member_state() {
        let mut m = Mocks::new();
        m.infra = removal_infra(|| Ok(statefulset(0)));
        let peers = peers_with_member_state();
        let mut member = m.member(peers.clone(), false);

        assert_eq!(member.handle(Event::Stop).await.unwrap(), Outcome::Done);
        assert_eq!(member_state(&peers).await, None);
        // Application scope survives
        assert!(peers
            .get(Scope::Application, CLUSTER_INITIALISED_KEY)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn story_scale_down_keeps_member_state() {
        let mut m = Mocks::new();
        m.infra = removal_infra(|| Ok(statefulset(1)));
        let peers = peers_with_member_state();
        let mut member = m.member(peers.clone(), false);

        assert_eq!(member.handle(Event::Stop).await.unwrap(), Outcome::Done);
        assert_eq!(member_state(&peers).await.as_deref(), Some("0.1.0"));
    }

    #[tokio::test]
    async fn story_removed_application_clears_member_state() {
        let mut m = Mocks::new();
        m.infra = removal_infra(|| Err(Error::not_found("StatefulSet", "postgresql-k8s")));
        let peers = peers_with_member_state();
        let mut member = m.member(peers.clone(), false);

        assert_eq!(member.handle(Event::Stop).await.unwrap(), Outcome::Done);
        assert_eq!(member_state(&peers).await, None);
    }
}
