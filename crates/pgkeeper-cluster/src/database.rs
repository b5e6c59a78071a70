//! Database user administration
//!
//! Only password rotation of the system users is needed here. The
//! connection authenticates as the operator user with the password held in
//! the secret store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use pgkeeper_common::{Error, Scope, SystemUser};
use pgkeeper_secrets::SecretStore;

const COLLABORATOR: &str = "database";

/// Changes database user passwords
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserAdmin: Send + Sync {
    /// Set a new password for `user`
    async fn update_user_password(&self, user: SystemUser, password: &str) -> Result<(), Error>;
}

/// Quote an identifier for interpolation into SQL
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into SQL
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

/// [`UserAdmin`] over a direct PostgreSQL connection to the primary
pub struct PostgresUserAdmin {
    host: String,
    port: u16,
    connect_timeout: Duration,
    secrets: Arc<SecretStore>,
}

impl PostgresUserAdmin {
    /// Admin connecting to `host:port`
    pub fn new(host: impl Into<String>, port: u16, secrets: Arc<SecretStore>) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            secrets,
        }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client, Error> {
        let operator = SystemUser::Operator;
        let password = Zeroizing::new(
            self.secrets
                .get(Scope::Application, &operator.password_key())
                .await?
                .ok_or_else(|| {
                    Error::internal_with_context(COLLABORATOR, "operator password is not set")
                })?,
        );

        let mut config = tokio_postgres::Config::new();
        config
            .application_name("pgkeeper")
            .host(&self.host)
            .port(self.port)
            .user(operator.username())
            .password(password.as_bytes())
            .dbname("postgres")
            .connect_timeout(self.connect_timeout);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| Error::remote(COLLABORATOR, e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "database connection closed with error");
            }
        });

        Ok(client)
    }
}

#[async_trait]
impl UserAdmin for PostgresUserAdmin {
    async fn update_user_password(&self, user: SystemUser, password: &str) -> Result<(), Error> {
        let client = self.connect().await?;
        let statement = Zeroizing::new(format!(
            "ALTER ROLE {} WITH PASSWORD {}",
            quote_identifier(user.username()),
            quote_literal(password)
        ));
        client
            .batch_execute(&statement)
            .await
            .map_err(|e| Error::remote_permanent(COLLABORATOR, e.to_string()))?;
        debug!(user = user.username(), "password updated");
        Ok(())
    }
}
