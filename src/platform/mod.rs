//! HTTP clients for the external video platform
//!
//! Implementations of the scheduler's collaborator traits:
//! - [`HttpVariantFetcher`]: downloads variant images
//! - [`HttpPublishClient`]: sets a video's thumbnail through the Data API
//! - [`HttpMetricsClient`]: queries the Analytics API for a campaign window
//! - [`CredentialProvider`]: resolves an owner's access token

pub mod analytics;
pub mod credentials;
pub mod fetch;
pub mod publish;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

pub use analytics::HttpMetricsClient;
pub use credentials::{CredentialProvider, OAuthRefreshCredentials, StaticCredentials};
pub use fetch::HttpVariantFetcher;
pub use publish::HttpPublishClient;

use crate::storage::RefreshTokenSource;

/// Default User-Agent for outgoing requests
pub const DEFAULT_USER_AGENT: &str = concat!("thumbwheel/", env!("CARGO_PKG_VERSION"));

/// Endpoints and client settings for the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Base URL for media uploads (`/upload/youtube/v3/...`)
    pub upload_base: String,

    /// Base URL of the Analytics API
    pub analytics_base: String,

    /// OAuth token endpoint
    pub token_url: String,

    /// OAuth client credentials; both must be set to enable token refresh
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    /// Fixed owner → access token map, used when OAuth is not configured
    pub access_tokens: HashMap<String, String>,

    /// Timeout for every HTTP request, in seconds
    pub http_timeout_secs: u64,

    /// Client-side cap on publish calls
    pub publish_requests_per_second: u32,

    pub user_agent: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            upload_base: "https://www.googleapis.com".to_string(),
            analytics_base: "https://youtubeanalytics.googleapis.com".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            client_id: None,
            client_secret: None,
            access_tokens: HashMap::new(),
            http_timeout_secs: 30,
            publish_requests_per_second: 2,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl PlatformConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Whether refresh-token exchange is available
    pub fn oauth_enabled(&self) -> bool {
        matches!((&self.client_id, &self.client_secret), (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty())
    }

    /// Build a shared HTTP client with the configured timeout
    pub fn http_client(&self) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(self.http_timeout())
            .gzip(true)
            .user_agent(self.user_agent.clone())
            .build()
    }

    /// Pick the credential provider this configuration describes
    pub fn credential_provider(
        &self,
        client: Client,
        tokens: Arc<dyn RefreshTokenSource>,
    ) -> Arc<dyn CredentialProvider> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if self.oauth_enabled() => Arc::new(
                OAuthRefreshCredentials::new(client, &self.token_url, id, secret, tokens),
            ),
            _ => Arc::new(StaticCredentials::new(self.access_tokens.clone())),
        }
    }
}
