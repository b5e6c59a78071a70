//! Error types for pgkeeper
//!
//! Errors are structured with fields to aid debugging in production.
//! The variants follow the failure taxonomy the reconcilers act on:
//! validation problems are fatal to the caller, remote failures may be
//! retried at the HA-manager boundary, and not-found / already-exists are
//! classified so the infra paths can treat them as benign where allowed.

use thiserror::Error;

/// Main error type for pgkeeper operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// HTTP transport error talking to a local collaborator
    #[error("http error: {source}")]
    Http {
        /// The underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// A remote object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (Pod, Service, Endpoints, ...)
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// A remote object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the conflicting object
        kind: String,
        /// Name of the conflicting object
        name: String,
    },

    /// Bad input type or shape
    #[error("validation error for {context}: {message}")]
    Validation {
        /// What was being validated (a secret key, a config option, ...)
        context: String,
        /// Description of what's invalid
        message: String,
    },

    /// A collaborator answered but reported a failure
    #[error("{collaborator} error: {message}")]
    Remote {
        /// Collaborator that failed (ha-manager, supervisor, database, ...)
        collaborator: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "bootstrap", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a named input
    pub fn validation_for(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a retryable remote error
    pub fn remote(collaborator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            collaborator: collaborator.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable remote error
    pub fn remote_permanent(collaborator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            collaborator: collaborator.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Whether the error means the target object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a fix).
    /// Kubernetes errors are retryable unless they are 4xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Http { source } => source.is_timeout() || source.is_connect(),
            Error::NotFound { .. } | Error::AlreadyExists { .. } => false,
            Error::Validation { .. } => false,
            Error::Remote { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
