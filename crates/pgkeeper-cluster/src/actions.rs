//! Caller-facing operations: read and rotate system-user passwords, and ask
//! who the primary is.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};
use zeroize::Zeroizing;

use pgkeeper_common::retry::{retry_with_backoff, RetryConfig};
use pgkeeper_common::users::generate_password;
use pgkeeper_common::{Error, Scope, SystemUser};
use pgkeeper_secrets::SecretStore;

use crate::database::UserAdmin;
use crate::ha::{HaManager, RenderParams};

/// Failures reported back to the caller of an action
#[derive(Debug, Error)]
pub enum ActionError {
    /// Password changes are only accepted on the leader
    #[error("Failed changing the password: only the leader can set passwords")]
    NotLeader,

    /// Username is not one of the system users
    #[error(transparent)]
    InvalidUser(Error),

    /// An explicitly given password is unusable
    #[error(transparent)]
    InvalidPassword(Error),

    /// Some member is still starting or syncing
    #[error("Failed changing the password: Not all members healthy or finished initial sync.")]
    MembersNotReady,

    /// The database rejected the new password
    #[error("Failed changing the password: {0}")]
    PasswordUpdate(#[source] Error),

    /// No password has been generated for this user yet
    #[error("password for {0} has not been generated yet")]
    PasswordUnavailable(SystemUser),

    /// The HA manager could not say who the primary is
    #[error("failed to get primary: {0}")]
    PrimaryUnavailable(#[source] Error),

    /// Reading or writing state failed
    #[error(transparent)]
    Store(#[from] Error),
}

/// Action handlers for one member
pub struct Actions {
    secrets: Arc<SecretStore>,
    ha: Arc<dyn HaManager>,
    users: Arc<dyn UserAdmin>,
    render: RenderParams,
    retry: RetryConfig,
}

impl Actions {
    /// Create the handlers
    pub fn new(
        secrets: Arc<SecretStore>,
        ha: Arc<dyn HaManager>,
        users: Arc<dyn UserAdmin>,
        render: RenderParams,
        retry: RetryConfig,
    ) -> Self {
        Self {
            secrets,
            ha,
            users,
            render,
            retry,
        }
    }

    /// Password of a system user, `operator` when no username is given
    pub async fn get_password(&self, username: Option<&str>) -> Result<String, ActionError> {
        let user = SystemUser::from_optional(username).map_err(ActionError::InvalidUser)?;
        self.secrets
            .get(Scope::Application, &user.password_key())
            .await?
            .ok_or(ActionError::PasswordUnavailable(user))
    }

    /// Rotate a system user's password
    ///
    /// A missing password means a freshly generated one; an empty one is
    /// rejected. Setting the current password again succeeds without
    /// touching anything.
    #[instrument(skip(self, password), fields(user = username.unwrap_or("operator")))]
    pub async fn set_password(
        &self,
        is_leader: bool,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), ActionError> {
        if !is_leader {
            return Err(ActionError::NotLeader);
        }
        let user = SystemUser::from_optional(username).map_err(ActionError::InvalidUser)?;
        if password.is_some_and(str::is_empty) {
            return Err(ActionError::InvalidPassword(Error::validation_for(
                "password",
                "the new password must not be empty",
            )));
        }
        let password = Zeroizing::new(password.map_or_else(generate_password, str::to_string));
        let key = user.password_key();

        let current = self
            .secrets
            .get(Scope::Application, &key)
            .await?
            .map(Zeroizing::new);
        if current.as_deref() == Some(&*password) {
            info!("The old and new passwords are equal.");
            return Ok(());
        }

        if !self.ha.are_all_members_ready().await {
            return Err(ActionError::MembersNotReady);
        }

        self.users
            .update_user_password(user, &password)
            .await
            .map_err(ActionError::PasswordUpdate)?;

        self.secrets
            .set(Scope::Application, &key, Some(password.as_str()))
            .await?;
        self.ha.render_configuration(&self.render).await?;
        info!("password updated");
        Ok(())
    }

    /// Member currently acting as primary
    pub async fn get_primary(&self) -> Result<String, ActionError> {
        retry_with_backoff(&self.retry, "get_primary", Error::is_retryable, || {
            self.ha.get_primary()
        })
        .await
        .map_err(ActionError::PrimaryUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MockUserAdmin;
    use crate::ha::MockHaManager;
    use mockall::predicate::{always, eq};
    use pgkeeper_common::ClusterIdentity;
    use pgkeeper_secrets::{MemoryConfidentialStore, MemoryPeerState};

    fn secrets() -> Arc<SecretStore> {
        Arc::new(SecretStore::new(
            ClusterIdentity::new("postgresql-k8s", "db", 0),
            Arc::new(MemoryPeerState::new()),
            Arc::new(MemoryConfidentialStore::new()),
        ))
    }

    fn actions(secrets: Arc<SecretStore>, ha: MockHaManager, users: MockUserAdmin) -> Actions {
        Actions::new(
            secrets,
            Arc::new(ha),
            Arc::new(users),
            RenderParams::default(),
            RetryConfig::immediate(2),
        )
    }

    async fn seed(secrets: &SecretStore) {
        secrets
            .set(Scope::Application, "operator-password", Some("test-password"))
            .await
            .unwrap();
        secrets
            .set(
                Scope::Application,
                "replication-password",
                Some("replication-test-password"),
            )
            .await
            .unwrap();
    }

    // ==========================================================================
    // get_password
    // ==========================================================================

    #[tokio::test]
    async fn test_get_password_defaults_to_operator() {
        let s = secrets();
        seed(&s).await;
        let a = actions(s, MockHaManager::new(), MockUserAdmin::new());

        assert_eq!(a.get_password(None).await.unwrap(), "test-password");
        assert_eq!(
            a.get_password(Some("replication")).await.unwrap(),
            "replication-test-password"
        );
    }

    #[tokio::test]
    async fn test_get_password_rejects_unknown_user() {
        let s = secrets();
        seed(&s).await;
        let a = actions(s, MockHaManager::new(), MockUserAdmin::new());

        let err = a.get_password(Some("user")).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidUser(_)));
        assert!(err.to_string().contains("'user' is not a user managed by the operator"));
    }

    #[tokio::test]
    async fn test_get_password_before_bootstrap() {
        let a = actions(secrets(), MockHaManager::new(), MockUserAdmin::new());
        assert!(matches!(
            a.get_password(Some("rewind")).await,
            Err(ActionError::PasswordUnavailable(SystemUser::Rewind))
        ));
    }

    // ==========================================================================
    // set_password
    // ==========================================================================

    #[tokio::test]
    async fn story_set_password_checks_run_in_order() {
        let s = secrets();
        seed(&s).await;

        // Not the leader: nothing else is consulted
        let a = actions(s.clone(), MockHaManager::new(), MockUserAdmin::new());
        assert!(matches!(
            a.set_password(false, None, None).await,
            Err(ActionError::NotLeader)
        ));

        // Unknown user
        assert!(matches!(
            a.set_password(true, Some("user"), None).await,
            Err(ActionError::InvalidUser(_))
        ));

        // Members not ready: database untouched
        let mut ha = MockHaManager::new();
        ha.expect_are_all_members_ready().times(1).returning(|| false);
        let mut users = MockUserAdmin::new();
        users.expect_update_user_password().times(0);
        let a = actions(s.clone(), ha, users);
        assert!(matches!(
            a.set_password(true, None, None).await,
            Err(ActionError::MembersNotReady)
        ));

        // Database rejects the change: nothing stored
        let mut ha = MockHaManager::new();
        ha.expect_are_all_members_ready().returning(|| true);
        ha.expect_render_configuration().times(0);
        let mut users = MockUserAdmin::new();
        users
            .expect_update_user_password()
            .times(1)
            .returning(|_, _| Err(Error::remote_permanent("database", "role does not exist")));
        let a = actions(s.clone(), ha, users);
        assert!(matches!(
            a.set_password(true, None, None).await,
            Err(ActionError::PasswordUpdate(_))
        ));
        assert_eq!(
            s.get(Scope::Application, "operator-password")
                .await
                .unwrap()
                .as_deref(),
            Some("test-password")
        );
    }

    #[tokio::test]
    async fn story_set_password_stores_and_rerenders() {
        let s = secrets();
        seed(&s).await;

        let mut ha = MockHaManager::new();
        ha.expect_are_all_members_ready().returning(|| true);
        ha.expect_render_configuration()
            .times(2)
            .returning(|_| Ok(()));
        let mut users = MockUserAdmin::new();
        users
            .expect_update_user_password()
            .with(eq(SystemUser::Operator), always())
            .times(1)
            .returning(|_, _| Ok(()));
        users
            .expect_update_user_password()
            .with(eq(SystemUser::Replication), eq("new-replication-password"))
            .times(1)
            .returning(|_, _| Ok(()));
        let a = actions(s.clone(), ha, users);

        // Generated password for the default user
        a.set_password(true, None, None).await.unwrap();
        let operator = s
            .get(Scope::Application, "operator-password")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(operator, "test-password");
        assert_eq!(operator.len(), 16);

        // Explicit user and password
        a.set_password(true, Some("replication"), Some("new-replication-password"))
            .await
            .unwrap();
        assert_eq!(
            s.get(Scope::Application, "replication-password")
                .await
                .unwrap()
                .as_deref(),
            Some("new-replication-password")
        );
    }

    #[tokio::test]
    async fn test_set_empty_password_is_rejected_before_any_change() {
        let s = secrets();
        seed(&s).await;
        // Any HA or database call would panic
        let a = actions(s.clone(), MockHaManager::new(), MockUserAdmin::new());

        let err = a.set_password(true, None, Some("")).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidPassword(_)));
        assert!(err.to_string().contains("must not be empty"));
        assert_eq!(
            a.get_password(None).await.unwrap(),
            "test-password",
            "stored credential must survive"
        );
    }

    #[tokio::test]
    async fn test_set_same_password_is_a_no_op() {
        let s = secrets();
        seed(&s).await;
        // Any HA or database call would panic
        let a = actions(s, MockHaManager::new(), MockUserAdmin::new());
        a.set_password(true, None, Some("test-password")).await.unwrap();
    }

    // ==========================================================================
    // get_primary
    // ==========================================================================

    #[tokio::test]
    async fn test_get_primary() {
        let mut ha = MockHaManager::new();
        ha.expect_get_primary()
            .times(1)
            .returning(|| Ok("postgresql-k8s-1".to_string()));
        let a = actions(secrets(), ha, MockUserAdmin::new());
        assert_eq!(a.get_primary().await.unwrap(), "postgresql-k8s-1");
    }

    #[tokio::test]
    async fn test_get_primary_fails_after_retries() {
        let mut ha = MockHaManager::new();
        ha.expect_get_primary()
            .times(2)
            .returning(|| Err(Error::remote("ha-manager", "fake error")));
        let a = actions(secrets(), ha, MockUserAdmin::new());
        assert!(matches!(
            a.get_primary().await,
            Err(ActionError::PrimaryUnavailable(_))
        ));
    }
}
