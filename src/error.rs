//! Crate-level error type
//!
//! Library modules return their own errors (`StoreError`, `SchedulerError`,
//! `PublishError`, ...). [`Error`] wraps all of them for callers that wire
//! the pieces together, and sorts them into an [`ErrorCategory`] so a
//! supervisor can tell a platform hiccup from a broken campaign definition.
//!
//! ```rust,ignore
//! use thumbwheel::error::Error;
//!
//! fn report(err: &Error) {
//!     let category = err.category().as_str();
//!     if err.is_recoverable() {
//!         tracing::warn!(category, error = %err, "Will retry on the next tick");
//!     } else {
//!         tracing::error!(category, error = %err, "Giving up");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::models::CampaignError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::server::{ConfigError as ServerConfigError, ServerError};
pub use crate::storage::StoreError;
pub use crate::utils::error::{CredentialError, FetchError, MetricsError, PublishError};

/// Coarse grouping used in logs and for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Platform and variant-host calls
    Network,
    /// Credential resolution and rejection
    Auth,
    /// Campaign store and local I/O
    Storage,
    /// Campaign definitions that fail validation
    Validation,
    /// Configuration errors
    Config,
    /// Driver lifecycle and store timeouts
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Storage => "storage",
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the thumbwheel crate
#[derive(Error, Debug)]
pub enum Error {
    /// Store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Invalid campaign definitions
    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),

    /// Variant download errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Publish errors
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Analytics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Credential errors
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Trigger server errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Anything else, with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Whether the same work may succeed if tried again later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Campaign(_) => false,
            Self::Fetch(e) => matches!(e, FetchError::Timeout | FetchError::Http(_)),
            Self::Publish(e) => e.is_retryable(),
            Self::Metrics(e) => matches!(e, MetricsError::QuotaExceeded | MetricsError::Http(_)),
            Self::Credential(e) => matches!(e, CredentialError::Http(_)),
            Self::Server(_) => false,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) | Self::Publish(_) | Self::Metrics(_) | Self::Http(_) => {
                ErrorCategory::Network
            }
            Self::Credential(_) => ErrorCategory::Auth,
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Campaign(_) | Self::Json(_) => ErrorCategory::Validation,
            Self::Scheduler(SchedulerError::ConfigError { .. }) => ErrorCategory::Config,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Server(ServerError::ConfigError(_)) | Self::Config(_) => ErrorCategory::Config,
            Self::Server(_) => ErrorCategory::Network,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Wrap a foreign error with context
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<ServerConfigError> for Error {
    fn from(err: ServerConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(Error::Fetch(FetchError::Timeout).category(), ErrorCategory::Network);

        let store_err = Error::Store(StoreError::LockPoisoned);
        assert_eq!(store_err.category(), ErrorCategory::Storage);

        let cred_err = Error::Credential(CredentialError::Missing("alice".to_string()));
        assert_eq!(cred_err.category(), ErrorCategory::Auth);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Fetch(FetchError::Timeout).is_recoverable());
        assert!(Error::Publish(PublishError::RateLimited { retry_after: None }).is_recoverable());
        assert!(!Error::Publish(PublishError::Fatal("bad".to_string())).is_recoverable());
        assert!(!Error::Campaign(CampaignError::NoVariants).is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let unified: Error = SchedulerError::AlreadyRunning.into();
        assert!(matches!(unified, Error::Scheduler(_)));
        assert!(!unified.is_recoverable());
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("Missing cron secret");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert_eq!(err.category().as_str(), "config");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_scheduler_config_error_category() {
        let err = Error::Scheduler(SchedulerError::config("tick_interval", "zero"));
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_other_error() {
        let err = Error::with_source("Reading campaign file", std::io::Error::other("gone"));
        assert_eq!(err.category(), ErrorCategory::Other);
        assert!(std::error::Error::source(&err).is_some());
    }
}
