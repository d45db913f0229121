//! Owner credential resolution
//!
//! Publishing and analytics calls act on behalf of a campaign owner. Tokens
//! are resolved per call; the OAuth provider caches access tokens until
//! shortly before they expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::storage::RefreshTokenSource;
use crate::utils::error::CredentialError;

/// Refresh this long before the platform-reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Used when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Resolves a bearer token for an owner
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, owner: &str) -> Result<String, CredentialError>;

    /// Forget any cached token for the owner, e.g. after a 401
    async fn invalidate(&self, _owner: &str) {}
}

/// Fixed owner → token map
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, owner: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(owner.into(), token.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self, owner: &str) -> Result<String, CredentialError> {
        self.tokens
            .get(owner)
            .cloned()
            .ok_or_else(|| CredentialError::Missing(owner.to_string()))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges stored refresh tokens at the OAuth token endpoint
pub struct OAuthRefreshCredentials {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    source: Arc<dyn RefreshTokenSource>,
    cache: RwLock<HashMap<String, CachedToken>>,
}

impl OAuthRefreshCredentials {
    pub fn new(
        client: Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        source: Arc<dyn RefreshTokenSource>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn cached(&self, owner: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .get(owner)
            .filter(|entry| Instant::now() < entry.refresh_at)
            .map(|entry| entry.token.clone())
    }

    async fn refresh(&self, owner: &str) -> Result<CachedToken, CredentialError> {
        let refresh_token = self
            .source
            .refresh_token(owner)
            .await
            .map_err(|e| CredentialError::Store(e.to_string()))?
            .ok_or_else(|| CredentialError::Missing(owner.to_string()))?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self.client.post(&self.token_url).form(&params).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                })
                .unwrap_or_else(|_| format!("status {}", status.as_u16()));
            warn!(owner = %owner, status = status.as_u16(), "Token refresh rejected");
            return Err(CredentialError::Rejected(reason));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        info!(owner = %owner, expires_in_secs = lifetime.as_secs(), "Refreshed access token");

        Ok(CachedToken {
            token: token.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        })
    }
}

#[async_trait]
impl CredentialProvider for OAuthRefreshCredentials {
    async fn access_token(&self, owner: &str) -> Result<String, CredentialError> {
        if let Some(token) = self.cached(owner).await {
            debug!(owner = %owner, "Using cached access token");
            return Ok(token);
        }

        let fresh = self.refresh(owner).await?;
        let token = fresh.token.clone();
        self.cache.write().await.insert(owner.to_string(), fresh);
        Ok(token)
    }

    async fn invalidate(&self, owner: &str) {
        self.cache.write().await.remove(owner);
    }
}
