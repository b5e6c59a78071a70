//! Backup repository validation
//!
//! Backup and restore orchestration lives outside this crate. The status
//! reconciler only needs to know whether a configured repository is usable,
//! and if not, the validator's own explanation.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use pgkeeper_common::Error;

/// Outcome of validating the configured repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepositoryCheck {
    /// Usable, or nothing configured
    Usable,
    /// Not usable; the message is shown to operators verbatim
    Unusable(String),
}

/// Validates an externally configured backup repository
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepositoryValidator: Send + Sync {
    /// Check the repository
    async fn can_use_repository(&self) -> Result<RepositoryCheck, Error>;
}

/// Validator for deployments without a backup repository
pub struct NoRepository;

#[async_trait]
impl RepositoryValidator for NoRepository {
    async fn can_use_repository(&self) -> Result<RepositoryCheck, Error> {
        Ok(RepositoryCheck::Usable)
    }
}
