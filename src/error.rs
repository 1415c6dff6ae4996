//! Error types for the pool broker
//!
//! Provides structured error types for the scheduler, class mapper, broker
//! and poollet components, plus the reconcile action each error implies.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Resource Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflict writing {kind}/{name}: resource version is stale")]
    Conflict { kind: String, name: String },

    #[error("Kind is not registered: {0}")]
    UnregisteredKind(String),

    // =========================================================================
    // Class Resolution Errors
    // =========================================================================
    #[error("No matching {kind} class for {name} with capabilities {signature}")]
    NoMatchingClass {
        kind: String,
        name: String,
        signature: String,
    },

    #[error("Ambiguous matching {kind} class for {name}: candidates {candidates:?}")]
    AmbiguousClass {
        kind: String,
        name: String,
        candidates: Vec<String>,
    },

    #[error("Class mapper for {kind} has not synced yet")]
    ClassesNotSynced { kind: String },

    // =========================================================================
    // Broker Errors
    // =========================================================================
    #[error("{operation} {key}: {source}")]
    Operation {
        operation: String,
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Missing secondary object {name} referenced by {kind} {id}")]
    MissingSecondary {
        kind: String,
        id: String,
        name: String,
    },

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    #[error("No suitable pool found for class: {class}")]
    NoSuitablePool { class: String },

    // =========================================================================
    // Runtime Transport Errors
    // =========================================================================
    #[error("Runtime transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Runtime returned {status}: {message}")]
    RuntimeApi { status: u16, message: String },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Label selector parse error: {0}")]
    SelectorParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap an error with the operation and key it happened under
    pub fn during(operation: impl Into<String>, key: impl Into<String>, source: Error) -> Self {
        Error::Operation {
            operation: operation.into(),
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Build a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// The innermost error, looking through operation wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.root() {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::Transport(_)
            | Error::RuntimeApi { .. } => ErrorAction::RequeueWithBackoff,

            // Startup barrier not passed yet
            Error::ClassesNotSynced { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Class resolution - controllers fed by a class mapper relist on
            // class changes; this timer is the fallback
            Error::NoMatchingClass { .. } | Error::AmbiguousClass { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Gone or never ours - wait for a new event
            Error::ResourceNotFound { .. } | Error::NoSuitablePool { .. } => ErrorAction::NoRequeue,

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::ApiValidation(_)
            | Error::SelectorParse(_)
            | Error::UnregisteredKind(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube(_) | Error::Conflict { .. } | Error::Transport(_)
        )
    }

    /// Check if the object is absent or not owned by the caller
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::ResourceNotFound { .. })
    }

    /// Check if this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    /// Check if this is a class resolution failure
    pub fn is_class_unresolved(&self) -> bool {
        matches!(
            self.root(),
            Error::NoMatchingClass { .. }
                | Error::AmbiguousClass { .. }
                | Error::ClassesNotSynced { .. }
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::NoMatchingClass {
            kind: "volume".into(),
            name: "fast".into(),
            signature: "(100, 200)".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::not_found("Volume", "vol-1");
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Conflict {
            kind: "Volume".into(),
            name: "vol-1".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_operation_wrapper_keeps_root() {
        let err = Error::during(
            "delete",
            "Volume default/abc",
            Error::not_found("Volume", "abc"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(err.to_string().starts_with("delete Volume default/abc:"));
    }
}
