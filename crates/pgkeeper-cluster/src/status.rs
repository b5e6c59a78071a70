//! Status Reconciler
//!
//! Periodic health evaluation producing the member's visible status. A tick
//! walks these gates in order and stops at the first one that decides:
//!
//! 1. supervisor unreachable: `Maintenance`
//! 2. no services planned yet: unchanged
//! 3. restore in flight: `Blocked` on failure, unchanged while running,
//!    otherwise finish the restore and continue
//! 4. repository unusable: `Blocked` with the validator's message
//! 5. database service down: restart it, `Maintenance`
//! 6. leadership lookup: `Active("Primary")` or `Active("")`, unchanged on
//!    lookup failure

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use pgkeeper_common::retry::{retry_with_backoff, RetryConfig};
use pgkeeper_common::{ClusterIdentity, Error, Scope, RESTORING_BACKUP_KEY};
use pgkeeper_secrets::PeerState;

use crate::backup::{RepositoryCheck, RepositoryValidator};
use crate::ha::{HaManager, RenderParams};
use crate::infra::{InfraApi, ResourceKind};
use crate::supervisor::{ProcessSupervisor, ServiceStatus, DATABASE_SERVICE};

/// Message of the primary's `Active` status
pub const PRIMARY_MESSAGE: &str = "Primary";

/// Message when a restore ended with the database stopped
pub const RESTORE_FAILED_MESSAGE: &str = "Failed to restore backup";

/// Message while the database service is being restarted
pub const RESTARTING_MESSAGE: &str = "restarting database service";

/// Message while the supervisor is not answering
pub const SUPERVISOR_UNREACHABLE_MESSAGE: &str = "waiting for process supervisor";

/// Pod annotation carrying the status state
pub const STATUS_ANNOTATION: &str = "pgkeeper.io/status";

/// Pod annotation carrying the status message
pub const STATUS_MESSAGE_ANNOTATION: &str = "pgkeeper.io/status-message";

/// Visible status states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusState {
    /// Work is in progress on this member
    Maintenance,
    /// Waiting on something outside this member
    Waiting,
    /// Needs operator attention
    Blocked,
    /// Serving
    Active,
}

impl StatusState {
    /// Lowercase name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Maintenance => "maintenance",
            StatusState::Waiting => "waiting",
            StatusState::Blocked => "blocked",
            StatusState::Active => "active",
        }
    }
}

/// A member's visible status
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitStatus {
    /// State
    pub state: StatusState,
    /// Human-readable message
    pub message: String,
}

impl UnitStatus {
    fn new(state: StatusState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }

    /// `Maintenance` with a message
    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::new(StatusState::Maintenance, message)
    }

    /// `Waiting` with a message
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::new(StatusState::Waiting, message)
    }

    /// `Blocked` with a message
    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(StatusState::Blocked, message)
    }

    /// `Active` with a message
    pub fn active(message: impl Into<String>) -> Self {
        Self::new(StatusState::Active, message)
    }
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self::maintenance("initialising")
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.state.as_str())
        } else {
            write!(f, "{}: {}", self.state.as_str(), self.message)
        }
    }
}

/// Where the visible status is published
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Publish a status
    async fn publish(&self, status: &UnitStatus) -> Result<(), Error>;
}

/// Publishes status as annotations on the member's Pod
pub struct PodAnnotationSink {
    api: Arc<dyn InfraApi>,
    identity: ClusterIdentity,
}

impl PodAnnotationSink {
    /// Sink for the Pod of `identity`
    pub fn new(api: Arc<dyn InfraApi>, identity: ClusterIdentity) -> Self {
        Self { api, identity }
    }
}

#[async_trait]
impl StatusSink for PodAnnotationSink {
    async fn publish(&self, status: &UnitStatus) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "annotations": {
                    STATUS_ANNOTATION: status.state.as_str(),
                    STATUS_MESSAGE_ANNOTATION: status.message,
                }
            }
        });
        self.api
            .patch(
                ResourceKind::Pod,
                &self.identity.member_name(),
                self.identity.namespace(),
                &patch,
            )
            .await
    }
}

enum RestoreProgress {
    Failed,
    InProgress,
    Completed,
}

/// Evaluates the member's status on each tick
pub struct StatusReconciler {
    identity: ClusterIdentity,
    peers: Arc<dyn PeerState>,
    supervisor: Arc<dyn ProcessSupervisor>,
    ha: Arc<dyn HaManager>,
    repository: Arc<dyn RepositoryValidator>,
    render: RenderParams,
    retry: RetryConfig,
}

impl StatusReconciler {
    /// Create a reconciler
    ///
    /// `render` is what gets pushed to the HA manager when a restore
    /// completes; `retry` bounds the leadership lookup.
    pub fn new(
        identity: ClusterIdentity,
        peers: Arc<dyn PeerState>,
        supervisor: Arc<dyn ProcessSupervisor>,
        ha: Arc<dyn HaManager>,
        repository: Arc<dyn RepositoryValidator>,
        render: RenderParams,
        retry: RetryConfig,
    ) -> Self {
        Self {
            identity,
            peers,
            supervisor,
            ha,
            repository,
            render,
            retry,
        }
    }

    /// Evaluate one tick, returning the status to show
    ///
    /// `current` is returned unchanged whenever the tick decides nothing.
    /// Leadership lookup failures are logged, never returned.
    pub async fn update_status(&self, current: &UnitStatus) -> Result<UnitStatus, Error> {
        if !self.supervisor.is_reachable().await {
            debug!("process supervisor not reachable yet");
            return Ok(UnitStatus::maintenance(SUPERVISOR_UNREACHABLE_MESSAGE));
        }

        let services = self.supervisor.get_service_statuses().await?;
        if services.is_empty() {
            debug!("no services planned yet");
            return Ok(current.clone());
        }

        if let Some(started) = self
            .peers
            .get(Scope::Application, RESTORING_BACKUP_KEY)
            .await?
        {
            match self.handle_restore(&services, &started).await? {
                RestoreProgress::Failed => return Ok(UnitStatus::blocked(RESTORE_FAILED_MESSAGE)),
                RestoreProgress::InProgress => return Ok(current.clone()),
                RestoreProgress::Completed => {}
            }
        }

        if let RepositoryCheck::Unusable(message) = self.repository.can_use_repository().await? {
            return Ok(UnitStatus::blocked(message));
        }

        if let Some(status) = self.handle_process_failures(&services).await? {
            return Ok(status);
        }

        Ok(self.primary_status(current).await)
    }

    async fn handle_restore(
        &self,
        services: &[ServiceStatus],
        started: &str,
    ) -> Result<RestoreProgress, Error> {
        let database_running = services
            .iter()
            .find(|s| s.name == DATABASE_SERVICE)
            .is_some_and(ServiceStatus::is_running);

        if !database_running {
            error!(restore_started = %started, "restore failed: database service is not running");
            return Ok(RestoreProgress::Failed);
        }

        if !self.ha.is_member_started().await {
            debug!(restore_started = %started, "restore still in progress");
            return Ok(RestoreProgress::InProgress);
        }

        self.ha.render_configuration(&self.render).await?;
        self.peers
            .delete(Scope::Application, RESTORING_BACKUP_KEY)
            .await?;
        info!(restore_started = %started, "restore finished");
        Ok(RestoreProgress::Completed)
    }

    async fn handle_process_failures(
        &self,
        services: &[ServiceStatus],
    ) -> Result<Option<UnitStatus>, Error> {
        let Some(database) = services.iter().find(|s| s.name == DATABASE_SERVICE) else {
            return Ok(None);
        };
        if database.is_running() {
            return Ok(None);
        }

        warn!(state = ?database.current, "database service is not running, restarting it");
        self.supervisor.restart_service(DATABASE_SERVICE).await?;
        Ok(Some(UnitStatus::maintenance(RESTARTING_MESSAGE)))
    }

    async fn primary_status(&self, current: &UnitStatus) -> UnitStatus {
        let primary = retry_with_backoff(&self.retry, "get_primary", Error::is_retryable, || {
            self.ha.get_primary()
        })
        .await;

        match primary {
            Ok(primary) if primary == self.identity.member_name() => {
                UnitStatus::active(PRIMARY_MESSAGE)
            }
            Ok(_) if self.ha.is_member_started().await => UnitStatus::active(""),
            Ok(_) => current.clone(),
            Err(e) => {
                error!("failed to get primary with error {e}");
                current.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MockRepositoryValidator;
    use crate::ha::MockHaManager;
    use crate::infra::MockInfraApi;
    use crate::supervisor::{MockProcessSupervisor, ServiceState};
    use mockall::predicate::eq;
    use pgkeeper_common::telemetry::capture::LogCapture;
    use pgkeeper_secrets::MemoryPeerState;
    use tracing::Level;

    const RESTORE_STARTED: &str = "2023-01-01T09:00:00Z";

    fn identity() -> ClusterIdentity {
        ClusterIdentity::new("postgresql-k8s", "db", 0)
    }

    fn services(state: ServiceState) -> Vec<ServiceStatus> {
        vec![ServiceStatus {
            name: DATABASE_SERVICE.to_string(),
            current: state,
        }]
    }

    fn supervisor_with(state: ServiceState) -> MockProcessSupervisor {
        let mut supervisor = MockProcessSupervisor::new();
        supervisor.expect_is_reachable().returning(|| true);
        supervisor
            .expect_get_service_statuses()
            .returning(move || Ok(services(state)));
        supervisor
    }

    fn usable_repository() -> MockRepositoryValidator {
        let mut repository = MockRepositoryValidator::new();
        repository
            .expect_can_use_repository()
            .returning(|| Ok(RepositoryCheck::Usable));
        repository
    }

    fn reconciler(
        peers: Arc<MemoryPeerState>,
        supervisor: MockProcessSupervisor,
        ha: MockHaManager,
        repository: MockRepositoryValidator,
    ) -> StatusReconciler {
        StatusReconciler::new(
            identity(),
            peers,
            Arc::new(supervisor),
            Arc::new(ha),
            Arc::new(repository),
            RenderParams::default(),
            RetryConfig::immediate(3),
        )
    }

    // ==========================================================================
    // Story: the supervisor gates everything
    // ==========================================================================

    #[tokio::test]
    async fn story_unreachable_supervisor_means_maintenance_and_no_ha_calls() {
        let mut supervisor = MockProcessSupervisor::new();
        supervisor.expect_is_reachable().returning(|| false);
        supervisor.expect_get_service_statuses().times(0);
        // MockHaManager without expectations panics on any call
        let r = reconciler(
            Arc::new(MemoryPeerState::new()),
            supervisor,
            MockHaManager::new(),
            MockRepositoryValidator::new(),
        );

        let status = r.update_status(&UnitStatus::active("")).await.unwrap();
        assert_eq!(status.state, StatusState::Maintenance);
    }

    #[tokio::test]
    async fn story_no_services_yet_leaves_status_alone() {
        let mut supervisor = MockProcessSupervisor::new();
        supervisor.expect_is_reachable().returning(|| true);
        supervisor.expect_get_service_statuses().returning(|| Ok(vec![]));
        let r = reconciler(
            Arc::new(MemoryPeerState::new()),
            supervisor,
            MockHaManager::new(),
            MockRepositoryValidator::new(),
        );

        let current = UnitStatus::waiting("awaiting for member to start");
        assert_eq!(r.update_status(&current).await.unwrap(), current);
    }

    // ==========================================================================
    // Story: leadership lookup
    // ==========================================================================

    #[tokio::test]
    async fn story_primary_gets_primary_message() {
        let mut ha = MockHaManager::new();
        ha.expect_get_primary()
            .times(1)
            .returning(|| Ok("postgresql-k8s-0".to_string()));
        let r = reconciler(
            Arc::new(MemoryPeerState::new()),
            supervisor_with(ServiceState::Active),
            ha,
            usable_repository(),
        );

        let status = r.update_status(&UnitStatus::default()).await.unwrap();
        assert_eq!(status, UnitStatus::active(PRIMARY_MESSAGE));
    }

    #[tokio::test]
    async fn story_started_replica_is_active_without_message() {
        let mut ha = MockHaManager::new();
        ha.expect_get_primary()
            .returning(|| Ok("postgresql-k8s-1".to_string()));
        ha.expect_is_member_started().returning(|| true);
        let r = reconciler(
            Arc::new(MemoryPeerState::new()),
            supervisor_with(ServiceState::Active),
            ha,
            usable_repository(),
        );

        let status = r.update_status(&UnitStatus::default()).await.unwrap();
        assert_eq!(status, UnitStatus::active(""));
    }

    #[tokio::test]
    async fn story_exhausted_leadership_lookup_keeps_status_and_logs_once() {
        let (capture, _guard) = LogCapture::install();
        let mut ha = MockHaManager::new();
        ha.expect_get_primary()
            .times(3)
            .returning(|| Err(Error::remote("ha-manager", "fake error")));
        let r = reconciler(
            Arc::new(MemoryPeerState::new()),
            supervisor_with(ServiceState::Active),
            ha,
            usable_repository(),
        );

        let current = UnitStatus::active("");
        assert_eq!(r.update_status(&current).await.unwrap(), current);

        let errors = capture.at(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .text
            .contains("failed to get primary with error ha-manager error: fake error"));
    }

    // ==========================================================================
    // Story: restore in flight
    // ==========================================================================

    #[tokio::test]
    async fn story_restore_with_stopped_database_blocks_and_keeps_marker() {
        let peers = Arc::new(MemoryPeerState::new());
        peers.seed(Scope::Application, RESTORING_BACKUP_KEY, RESTORE_STARTED);
        let mut ha = MockHaManager::new();
        ha.expect_render_configuration().times(0);
        ha.expect_get_primary().times(0);
        let mut supervisor = supervisor_with(ServiceState::Inactive);
        supervisor.expect_restart_service().times(0);

        let r = reconciler(peers.clone(), supervisor, ha, MockRepositoryValidator::new());
        let status = r.update_status(&UnitStatus::active("")).await.unwrap();

        assert_eq!(status, UnitStatus::blocked(RESTORE_FAILED_MESSAGE));
        assert_eq!(
            peers
                .snapshot(Scope::Application)
                .get(RESTORING_BACKUP_KEY)
                .map(String::as_str),
            Some(RESTORE_STARTED)
        );
    }

    #[tokio::test]
    async fn story_restore_waits_for_member_to_start() {
        let peers = Arc::new(MemoryPeerState::new());
        peers.seed(Scope::Application, RESTORING_BACKUP_KEY, RESTORE_STARTED);
        let mut ha = MockHaManager::new();
        ha.expect_is_member_started().returning(|| false);
        ha.expect_render_configuration().times(0);
        ha.expect_get_primary().times(0);

        let r = reconciler(
            peers.clone(),
            supervisor_with(ServiceState::Active),
            ha,
            MockRepositoryValidator::new(),
        );
        let current = UnitStatus::active("");
        assert_eq!(r.update_status(&current).await.unwrap(), current);
        assert!(peers
            .snapshot(Scope::Application)
            .contains_key(RESTORING_BACKUP_KEY));
    }

    #[tokio::test]
    async fn story_completed_restore_clears_marker_and_resumes() {
        let peers = Arc::new(MemoryPeerState::new());
        peers.seed(Scope::Application, RESTORING_BACKUP_KEY, RESTORE_STARTED);
        let mut ha = MockHaManager::new();
        ha.expect_is_member_started().returning(|| true);
        ha.expect_render_configuration()
            .with(eq(RenderParams::default()))
            .times(1)
            .returning(|_| Ok(()));
        ha.expect_get_primary()
            .times(1)
            .returning(|| Ok("postgresql-k8s-0".to_string()));

        let r = reconciler(
            peers.clone(),
            supervisor_with(ServiceState::Active),
            ha,
            usable_repository(),
        );
        let status = r.update_status(&UnitStatus::active("")).await.unwrap();

        assert_eq!(status, UnitStatus::active(PRIMARY_MESSAGE));
        assert!(peers.snapshot(Scope::Application).is_empty());
    }

    // ==========================================================================
    // Story: repository and process failures
    // ==========================================================================

    #[tokio::test]
    async fn story_unusable_repository_blocks_with_its_message() {
        let mut repository = MockRepositoryValidator::new();
        repository
            .expect_can_use_repository()
            .times(1)
            .returning(|| Ok(RepositoryCheck::Unusable("bad repo".to_string())));
        let mut ha = MockHaManager::new();
        ha.expect_get_primary().times(0);
        let mut supervisor = supervisor_with(ServiceState::Inactive);
        supervisor.expect_restart_service().times(0);

        let r = reconciler(Arc::new(MemoryPeerState::new()), supervisor, ha, repository);
        let status = r.update_status(&UnitStatus::active("")).await.unwrap();

        assert_eq!(status.state, StatusState::Blocked);
        assert_eq!(status.message, "bad repo");
    }

    #[tokio::test]
    async fn story_stopped_database_is_restarted() {
        let mut supervisor = supervisor_with(ServiceState::Error);
        supervisor
            .expect_restart_service()
            .with(eq(DATABASE_SERVICE))
            .times(1)
            .returning(|_| Ok(()));
        let mut ha = MockHaManager::new();
        ha.expect_get_primary().times(0);

        let r = reconciler(
            Arc::new(MemoryPeerState::new()),
            supervisor,
            ha,
            usable_repository(),
        );
        let status = r.update_status(&UnitStatus::active("")).await.unwrap();
        assert_eq!(status, UnitStatus::maintenance(RESTARTING_MESSAGE));
    }

    #[tokio::test]
    async fn test_pod_annotation_sink_patches_member_pod() {
        let mut api = MockInfraApi::new();
        api.expect_patch()
            .with(
                eq(ResourceKind::Pod),
                eq("postgresql-k8s-0"),
                eq("db"),
                eq(json!({
                    "metadata": {
                        "annotations": {
                            "pgkeeper.io/status": "blocked",
                            "pgkeeper.io/status-message": "bad repo",
                        }
                    }
                })),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let sink = PodAnnotationSink::new(Arc::new(api), identity());
        sink.publish(&UnitStatus::blocked("bad repo")).await.unwrap();
    }

    #[test]
    fn test_status_display() {
        assert_eq!(UnitStatus::active("").to_string(), "active");
        assert_eq!(
            UnitStatus::blocked("bad repo").to_string(),
            "blocked: bad repo"
        );
    }
}
