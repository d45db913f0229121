//! Variant download over HTTP

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client};
use tracing::debug;
use url::Url;

use crate::scheduler::executor::{VariantFetcher, VariantPayload};
use crate::utils::error::FetchError;

/// Fetches variant images from their public URLs
#[derive(Debug, Clone)]
pub struct HttpVariantFetcher {
    client: Client,
}

impl HttpVariantFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VariantFetcher for HttpVariantFetcher {
    async fn fetch_bytes(&self, locator: &str) -> Result<VariantPayload, FetchError> {
        let url = Url::parse(locator).map_err(|e| FetchError::InvalidUrl(format!("{locator}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(locator.to_string()));
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e)
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(locator.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let bytes: Bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e)
            }
        })?;

        debug!(locator = %locator, mime_type = %mime_type, bytes = bytes.len(), "Fetched variant");

        Ok(VariantPayload { bytes, mime_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_http_locator() {
        let fetcher = HttpVariantFetcher::new(Client::new());

        assert!(matches!(
            fetcher.fetch_bytes("ftp://host/a.png").await,
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            fetcher.fetch_bytes("not a url").await,
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
