//! Error types for external collaborators
//!
//! These are the failure shapes the scheduler reacts to. Only
//! `PublishError::RateLimited` is retried by the executor; every other
//! publish error is a fatal per-item failure for the current tick.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while downloading a variant
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code
    #[error("Variant fetch returned status {0}")]
    Status(u16),

    /// Request timeout
    #[error("Variant fetch timed out")]
    Timeout,

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Locator not known to the fetcher
    #[error("Variant not found: {0}")]
    NotFound(String),
}

/// Errors returned by the publishing platform
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    /// Platform asked us to slow down
    #[error("Rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials were rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No credentials stored for the owner
    #[error("Missing credentials for owner '{0}'")]
    MissingCredentials(String),

    /// Any other non-retryable failure
    #[error("Publish failed: {0}")]
    Fatal(String),
}

impl PublishError {
    /// Whether the executor should retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::RateLimited { .. })
    }
}

/// Errors returned by the analytics platform
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Daily or per-minute quota exhausted
    #[error("Analytics quota exceeded")]
    QuotaExceeded,

    /// Credentials were rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No credentials stored for the owner
    #[error("Missing credentials for owner '{0}'")]
    MissingCredentials(String),

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code
    #[error("Analytics request returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response could not be interpreted
    #[error("Malformed analytics response: {0}")]
    Decode(String),

    /// Credential lookup failed for a reason other than a rejection
    #[error("Credential lookup failed: {0}")]
    Credentials(String),
}

/// Errors that can occur while resolving an owner's access token
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Nothing stored for the owner
    #[error("No credentials for owner '{0}'")]
    Missing(String),

    /// Token endpoint rejected the refresh
    #[error("Token refresh rejected: {0}")]
    Rejected(String),

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Refresh token lookup failed
    #[error("Token store error: {0}")]
    Store(String),
}

impl From<CredentialError> for PublishError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Missing(owner) => PublishError::MissingCredentials(owner),
            CredentialError::Rejected(reason) => PublishError::Unauthorized(reason),
            other => PublishError::Fatal(other.to_string()),
        }
    }
}

impl From<CredentialError> for MetricsError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Missing(owner) => MetricsError::MissingCredentials(owner),
            CredentialError::Rejected(reason) => MetricsError::Unauthorized(reason),
            CredentialError::Http(e) => MetricsError::Http(e),
            CredentialError::Store(reason) => MetricsError::Credentials(reason),
        }
    }
}
