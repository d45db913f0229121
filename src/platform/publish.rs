//! Thumbnail publishing through the YouTube Data API
//!
//! Uses the `thumbnails.set` media upload. Calls are paced client-side with
//! a governor rate limiter so a burst of due campaigns does not trip the
//! platform's per-user limits.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER},
    Client, StatusCode,
};
use tracing::{debug, warn};

use super::credentials::CredentialProvider;
use crate::scheduler::executor::{PublishClient, PublishRequest};
use crate::utils::error::PublishError;
use crate::utils::truncate_text;

/// Error reasons the platform uses for quota and rate limiting on 403
const RATE_LIMIT_REASONS: &[&str] = &[
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
];

/// Sets video thumbnails on behalf of campaign owners
pub struct HttpPublishClient {
    client: Client,
    upload_base: String,
    credentials: Arc<dyn CredentialProvider>,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl HttpPublishClient {
    /// Create a publish client
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `upload_base` - Scheme and host of the upload endpoint
    /// * `credentials` - Resolves owner access tokens
    /// * `requests_per_second` - Client-side cap on publish calls (0 is treated as 1)
    pub fn new(
        client: Client,
        upload_base: &str,
        credentials: Arc<dyn CredentialProvider>,
        requests_per_second: u32,
    ) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            client,
            upload_base: upload_base.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/upload/youtube/v3/thumbnails/set", self.upload_base)
    }
}

#[async_trait]
impl PublishClient for HttpPublishClient {
    async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError> {
        let token = self.credentials.access_token(&request.owner).await?;

        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .post(self.endpoint())
            .query(&[
                ("videoId", request.target_resource.as_str()),
                ("uploadType", "media"),
            ])
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, request.mime_type.as_str())
            .body(request.bytes.clone())
            .send()
            .await
            .map_err(|e| PublishError::Fatal(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(
                target_resource = %request.target_resource,
                bytes = request.bytes.len(),
                "Thumbnail set"
            );
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let error = classify_failure(status, &body, retry_after);

        if matches!(error, PublishError::Unauthorized(_)) {
            self.credentials.invalidate(&request.owner).await;
        }
        warn!(
            target_resource = %request.target_resource,
            status = status.as_u16(),
            error = %error,
            "Thumbnail publish rejected"
        );
        Err(error)
    }
}

/// Map a non-success response to a publish error
pub(crate) fn classify_failure(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> PublishError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => PublishError::RateLimited { retry_after },
        StatusCode::FORBIDDEN if names_rate_limit(body) => PublishError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED => PublishError::Unauthorized(truncate_text(body, 200)),
        _ => PublishError::Fatal(format!(
            "status {}: {}",
            status.as_u16(),
            truncate_text(body, 200)
        )),
    }
}

/// Whether an error body names a quota or rate-limit reason
pub(crate) fn names_rate_limit(body: &str) -> bool {
    RATE_LIMIT_REASONS.iter().any(|reason| body.contains(reason))
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_rate_limits() {
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, "", Some(Duration::from_secs(5))),
            PublishError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );

        let quota_body = r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#;
        assert!(classify_failure(StatusCode::FORBIDDEN, quota_body, None).is_retryable());
    }

    #[test]
    fn test_classify_other_forbidden_is_fatal() {
        let body = r#"{"error":{"errors":[{"reason":"forbidden"}]}}"#;
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, body, None),
            PublishError::Fatal(_)
        ));
    }

    #[test]
    fn test_classify_unauthorized() {
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, "invalid token", None),
            PublishError::Unauthorized(_)
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
