//! Rotation execution
//!
//! Fetches the next variant of a campaign, checks it against the platform's
//! thumbnail constraints and publishes it. The executor never touches the
//! store: the outcome is handed to the committer by the driver.
//!
//! Only `PublishError::RateLimited` is retried, with capped exponential
//! backoff. Everything else fails the campaign for this tick.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::models::{content_digest, Campaign};
use crate::utils::error::{FetchError, PublishError};
use crate::utils::format_bytes;
use crate::utils::retry::{with_retry_if, RetryConfig};

// ============================================================================
// Collaborators
// ============================================================================

/// Downloaded variant bytes with their declared content type
#[derive(Debug, Clone)]
pub struct VariantPayload {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// Source of variant images
#[async_trait]
pub trait VariantFetcher: Send + Sync {
    /// Download the bytes behind a variant locator
    async fn fetch_bytes(&self, locator: &str) -> Result<VariantPayload, FetchError>;
}

/// One publish call
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub owner: String,
    pub target_resource: String,
    pub bytes: Bytes,
    pub mime_type: String,
}

/// External platform that receives the new thumbnail
///
/// Implementations resolve the owner's credentials themselves.
#[async_trait]
pub trait PublishClient: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError>;
}

// ============================================================================
// Validation
// ============================================================================

/// Constraints a variant must satisfy before it is published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Accepted content types (lower-case, without parameters)
    pub allowed_mime_types: Vec<String>,

    /// Maximum payload size in bytes
    pub max_bytes: usize,

    /// Minimum decoded width in pixels
    pub min_width: u32,

    /// Minimum decoded height in pixels
    pub min_height: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/jpg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
            max_bytes: 2 * 1024 * 1024,
            min_width: 640,
            min_height: 0,
        }
    }
}

/// Reasons a variant is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unsupported content type '{0}'")]
    UnsupportedMime(String),

    #[error("Variant is empty")]
    Empty,

    #[error("Variant is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Variant could not be decoded: {0}")]
    Undecodable(String),

    #[error("Variant width {width}px is below the {min}px minimum")]
    TooNarrow { width: u32, min: u32 },

    #[error("Variant height {height}px is below the {min}px minimum")]
    TooShort { height: u32, min: u32 },
}

/// Dimensions and normalized content type of a validated variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Checks content type, size and dimensions of a variant
#[derive(Debug, Clone, Default)]
pub struct VariantValidator {
    config: ValidatorConfig,
}

impl VariantValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a payload, reading dimensions from the image header
    pub fn validate(&self, payload: &VariantPayload) -> Result<ImageInfo, ValidationError> {
        let mime_type = normalize_mime(&payload.mime_type);
        if !self.config.allowed_mime_types.iter().any(|m| *m == mime_type) {
            return Err(ValidationError::UnsupportedMime(mime_type));
        }

        let size = payload.bytes.len();
        if size == 0 {
            return Err(ValidationError::Empty);
        }
        if size > self.config.max_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.config.max_bytes,
            });
        }

        let (width, height) = image::ImageReader::new(Cursor::new(payload.bytes.as_ref()))
            .with_guessed_format()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?
            .into_dimensions()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;

        if width < self.config.min_width {
            return Err(ValidationError::TooNarrow {
                width,
                min: self.config.min_width,
            });
        }
        if height < self.config.min_height {
            return Err(ValidationError::TooShort {
                height,
                min: self.config.min_height,
            });
        }

        Ok(ImageInfo {
            mime_type,
            width,
            height,
        })
    }
}

/// Lower-case a content type and drop its parameters
fn normalize_mime(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

// ============================================================================
// Outcomes
// ============================================================================

/// A variant that is now live on the target resource
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedVariant {
    pub campaign_id: Uuid,
    pub variant_index: usize,
    pub locator: String,
    pub mime_type: String,
    pub byte_len: usize,
    pub digest: String,
    pub width: u32,
    pub height: u32,
    pub attempts: u32,
}

/// Why a rotation did not happen
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureKind {
    #[error("Campaign has no variants")]
    NoVariants,

    #[error("Variant fetch failed: {0}")]
    Fetch(String),

    #[error("Invalid variant: {0}")]
    Invalid(ValidationError),

    #[error("Rate limited, retries exhausted")]
    RateLimited,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Missing credentials for owner '{0}'")]
    MissingCredentials(String),

    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("{stage} timed out")]
    Timeout { stage: &'static str },
}

impl FailureKind {
    /// Short label used for metrics and reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoVariants => "no_variants",
            Self::Fetch(_) => "fetch",
            Self::Invalid(_) => "invalid",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::MissingCredentials(_) => "missing_credentials",
            Self::Rejected(_) => "rejected",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Whether the failure came from a transient platform condition
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout { .. } | Self::Fetch(_))
    }
}

impl From<PublishError> for FailureKind {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::RateLimited { .. } => Self::RateLimited,
            PublishError::Unauthorized(reason) => Self::Unauthorized(reason),
            PublishError::MissingCredentials(owner) => Self::MissingCredentials(owner),
            PublishError::Fatal(reason) => Self::Rejected(reason),
        }
    }
}

/// Soft failure of one campaign for one tick
///
/// Carries the number of publish attempts and the backoff delays that were
/// slept, so retry behavior is observable from the outcome alone.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} (after {attempts} publish attempts)")]
pub struct RotationFailure {
    pub kind: FailureKind,
    pub attempts: u32,
    pub backoff: Vec<Duration>,
}

impl RotationFailure {
    /// Failure before any publish attempt was made
    pub fn before_publish(kind: FailureKind) -> Self {
        Self {
            kind,
            attempts: 0,
            backoff: Vec::new(),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Executor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,

    /// Bound on each fetch and each publish attempt
    pub call_timeout: Duration,

    pub validator: ValidatorConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(30),
            validator: ValidatorConfig::default(),
        }
    }
}

/// Publish attempt failure, including the per-call timeout
enum AttemptError {
    Publish(PublishError),
    TimedOut,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish(e) => write!(f, "{e}"),
            Self::TimedOut => write!(f, "publish timed out"),
        }
    }
}

/// Publishes the next variant of a campaign
pub struct RotationExecutor {
    fetcher: Arc<dyn VariantFetcher>,
    publisher: Arc<dyn PublishClient>,
    validator: VariantValidator,
    config: ExecutorConfig,
}

impl RotationExecutor {
    pub fn new(
        fetcher: Arc<dyn VariantFetcher>,
        publisher: Arc<dyn PublishClient>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            fetcher,
            publisher,
            validator: VariantValidator::new(config.validator.clone()),
            config,
        }
    }

    /// Fetch, validate and publish variant `(current_index + 1) % len`
    pub async fn execute(&self, campaign: &Campaign) -> Result<PublishedVariant, RotationFailure> {
        let next_index = campaign.next_index();
        let Some(locator) = campaign.variants.get(next_index) else {
            return Err(RotationFailure::before_publish(FailureKind::NoVariants));
        };

        let payload =
            match tokio::time::timeout(self.config.call_timeout, self.fetcher.fetch_bytes(locator))
                .await
            {
                Ok(Ok(payload)) => payload,
                Ok(Err(e)) => {
                    warn!(campaign_id = %campaign.id, locator = %locator, error = %e, "Variant fetch failed");
                    return Err(RotationFailure::before_publish(FailureKind::Fetch(
                        e.to_string(),
                    )));
                }
                Err(_) => {
                    warn!(campaign_id = %campaign.id, locator = %locator, "Variant fetch timed out");
                    return Err(RotationFailure::before_publish(FailureKind::Timeout {
                        stage: "fetch",
                    }));
                }
            };

        let info = self.validator.validate(&payload).map_err(|e| {
            warn!(campaign_id = %campaign.id, locator = %locator, error = %e, "Variant rejected");
            RotationFailure::before_publish(FailureKind::Invalid(e))
        })?;

        debug!(
            campaign_id = %campaign.id,
            variant_index = next_index,
            width = info.width,
            height = info.height,
            size = %format_bytes(payload.bytes.len() as u64),
            "Variant validated"
        );

        let request = PublishRequest {
            owner: campaign.owner.clone(),
            target_resource: campaign.target_resource.clone(),
            bytes: payload.bytes.clone(),
            mime_type: info.mime_type.clone(),
        };

        let publisher = &self.publisher;
        let request_ref = &request;
        let call_timeout = self.config.call_timeout;

        let outcome = with_retry_if(
            &self.config.retry,
            || async move {
                let result =
                    match tokio::time::timeout(call_timeout, publisher.publish(request_ref)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(AttemptError::Publish(e)),
                        Err(_) => Err(AttemptError::TimedOut),
                    };
                metrics::record_publish_attempt(match &result {
                    Ok(()) => "ok",
                    Err(AttemptError::Publish(PublishError::RateLimited { .. })) => "rate_limited",
                    Err(AttemptError::TimedOut) => "timeout",
                    Err(AttemptError::Publish(_)) => "error",
                });
                result
            },
            |e| matches!(e, AttemptError::Publish(p) if p.is_retryable()),
        )
        .await;

        match outcome.result {
            Ok(()) => {
                info!(
                    campaign_id = %campaign.id,
                    target = %campaign.target_resource,
                    variant_index = next_index,
                    attempts = outcome.attempts,
                    "Variant published"
                );
                Ok(PublishedVariant {
                    campaign_id: campaign.id,
                    variant_index: next_index,
                    locator: locator.clone(),
                    mime_type: info.mime_type,
                    byte_len: payload.bytes.len(),
                    digest: content_digest(&payload.bytes),
                    width: info.width,
                    height: info.height,
                    attempts: outcome.attempts,
                })
            }
            Err(e) => {
                let kind = match e {
                    AttemptError::Publish(p) => FailureKind::from(p),
                    AttemptError::TimedOut => FailureKind::Timeout { stage: "publish" },
                };
                warn!(
                    campaign_id = %campaign.id,
                    attempts = outcome.attempts,
                    error = %kind,
                    "Publish failed"
                );
                Err(RotationFailure {
                    kind,
                    attempts: outcome.attempts,
                    backoff: outcome.delays,
                })
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCampaign;
    use crate::scheduler::cadence::{Cadence, CadenceUnit};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use image::{ImageFormat, RgbImage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn png(width: u32, height: u32) -> Bytes {
        let mut buf = Vec::new();
        RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        Bytes::from(buf)
    }

    fn payload(width: u32, mime: &str) -> VariantPayload {
        VariantPayload {
            bytes: png(width, 360),
            mime_type: mime.to_string(),
        }
    }

    struct StaticFetcher {
        width: u32,
        mime: String,
    }

    #[async_trait]
    impl VariantFetcher for StaticFetcher {
        async fn fetch_bytes(&self, _locator: &str) -> Result<VariantPayload, FetchError> {
            Ok(payload(self.width, &self.mime))
        }
    }

    /// Publisher that replays a script of results, then succeeds
    #[derive(Default)]
    struct ScriptedPublisher {
        script: Mutex<VecDeque<Result<(), PublishError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedPublisher {
        fn with(script: Vec<Result<(), PublishError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PublishClient for ScriptedPublisher {
        async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError> {
            self.calls
                .lock()
                .unwrap()
                .push(request.target_resource.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn campaign() -> Campaign {
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        NewCampaign {
            owner: "owner".to_string(),
            target_resource: "video".to_string(),
            variants: vec![
                "https://cdn.test/a.png".to_string(),
                "https://cdn.test/b.png".to_string(),
                "https://cdn.test/c.png".to_string(),
            ],
            window_start: start,
            window_end: start + ChronoDuration::days(1),
            cadence: Cadence::new(1, CadenceUnit::Hours),
        }
        .into_campaign()
        .unwrap()
    }

    fn executor(publisher: Arc<ScriptedPublisher>, width: u32) -> RotationExecutor {
        let fetcher = Arc::new(StaticFetcher {
            width,
            mime: "image/png".to_string(),
        });
        RotationExecutor::new(fetcher, publisher, ExecutorConfig::default())
    }

    #[test]
    fn test_validator_accepts_good_png() {
        let validator = VariantValidator::default();
        let info = validator
            .validate(&payload(1280, "image/PNG; charset=binary"))
            .unwrap();
        assert_eq!(info.mime_type, "image/png");
        assert_eq!((info.width, info.height), (1280, 360));
    }

    #[test]
    fn test_validator_rejections() {
        let validator = VariantValidator::default();

        assert_eq!(
            validator.validate(&payload(1280, "image/gif")),
            Err(ValidationError::UnsupportedMime("image/gif".to_string()))
        );
        assert_eq!(
            validator.validate(&payload(320, "image/png")),
            Err(ValidationError::TooNarrow {
                width: 320,
                min: 640
            })
        );
        assert_eq!(
            validator.validate(&VariantPayload {
                bytes: Bytes::new(),
                mime_type: "image/png".to_string()
            }),
            Err(ValidationError::Empty)
        );
        assert!(matches!(
            validator.validate(&VariantPayload {
                bytes: Bytes::from_static(b"definitely not an image"),
                mime_type: "image/png".to_string()
            }),
            Err(ValidationError::Undecodable(_))
        ));
    }

    #[test]
    fn test_validator_size_limit() {
        let validator = VariantValidator::new(ValidatorConfig {
            max_bytes: 64,
            ..Default::default()
        });
        assert!(matches!(
            validator.validate(&payload(1280, "image/png")),
            Err(ValidationError::TooLarge { max: 64, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_next_variant() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let mut c = campaign();
        c.current_index = 2;

        let published = executor(Arc::clone(&publisher), 1280)
            .execute(&c)
            .await
            .unwrap();

        assert_eq!(published.variant_index, 0);
        assert_eq!(published.locator, "https://cdn.test/a.png");
        assert_eq!(published.attempts, 1);
        assert_eq!(published.digest.len(), 64);
        assert_eq!(publisher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_with_increasing_backoff() {
        let publisher = Arc::new(ScriptedPublisher::with(vec![
            Err(PublishError::RateLimited { retry_after: None }),
            Err(PublishError::RateLimited { retry_after: None }),
            Err(PublishError::RateLimited { retry_after: None }),
        ]));

        let failure = executor(Arc::clone(&publisher), 1280)
            .execute(&campaign())
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::RateLimited);
        assert_eq!(failure.attempts, 3);
        assert_eq!(publisher.calls(), 3);
        assert_eq!(failure.backoff.len(), 2);
        assert!(failure.backoff[1] > failure.backoff[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success() {
        let publisher = Arc::new(ScriptedPublisher::with(vec![Err(
            PublishError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            },
        )]));

        let published = executor(Arc::clone(&publisher), 1280)
            .execute(&campaign())
            .await
            .unwrap();
        assert_eq!(published.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_fails_fast() {
        let publisher = Arc::new(ScriptedPublisher::with(vec![Err(
            PublishError::MissingCredentials("owner".to_string()),
        )]));

        let failure = executor(Arc::clone(&publisher), 1280)
            .execute(&campaign())
            .await
            .unwrap_err();

        assert_eq!(
            failure.kind,
            FailureKind::MissingCredentials("owner".to_string())
        );
        assert_eq!(failure.attempts, 1);
        assert!(failure.backoff.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_variant_never_published() {
        let publisher = Arc::new(ScriptedPublisher::default());

        let failure = executor(Arc::clone(&publisher), 320)
            .execute(&campaign())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.kind,
            FailureKind::Invalid(ValidationError::TooNarrow { .. })
        ));
        assert_eq!(failure.attempts, 0);
        assert_eq!(publisher.calls(), 0);
    }

    struct HangingPublisher;

    #[async_trait]
    impl PublishClient for HangingPublisher {
        async fn publish(&self, _request: &PublishRequest) -> Result<(), PublishError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_is_soft_failure() {
        let fetcher = Arc::new(StaticFetcher {
            width: 1280,
            mime: "image/png".to_string(),
        });
        let executor = RotationExecutor::new(
            fetcher,
            Arc::new(HangingPublisher),
            ExecutorConfig {
                call_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let failure = executor.execute(&campaign()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout { stage: "publish" });
        assert_eq!(failure.attempts, 1);
    }
}
