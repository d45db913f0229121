//! Per-video analytics through the YouTube Analytics API (v2 reports)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::AUTHORIZATION, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::credentials::CredentialProvider;
use super::publish::names_rate_limit;
use crate::models::MetricsRow;
use crate::scheduler::finalizer::MetricsClient;
use crate::utils::error::MetricsError;
use crate::utils::truncate_text;

/// Metrics requested for every report, in column order
const REPORT_METRICS: &str = "views,estimatedMinutesWatched,averageViewDuration,likes,comments";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportResponse {
    #[serde(default)]
    column_headers: Vec<ColumnHeader>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ColumnHeader {
    name: String,
}

/// Queries the Analytics API for a video's metrics over a date range
pub struct HttpMetricsClient {
    client: Client,
    analytics_base: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMetricsClient {
    pub fn new(
        client: Client,
        analytics_base: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            analytics_base: analytics_base.trim_end_matches('/').to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl MetricsClient for HttpMetricsClient {
    async fn collect(
        &self,
        owner: &str,
        target_resource: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<MetricsRow>, MetricsError> {
        let token = self.credentials.access_token(owner).await?;

        let start_date = window_start.date_naive().to_string();
        let end_date = window_end.date_naive().to_string();
        let filter = format!("video=={target_resource}");

        let response = self
            .client
            .get(format!("{}/v2/reports", self.analytics_base))
            .query(&[
                ("ids", "channel==MINE"),
                ("startDate", start_date.as_str()),
                ("endDate", end_date.as_str()),
                ("metrics", REPORT_METRICS),
                ("dimensions", "video"),
                ("filters", filter.as_str()),
            ])
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => MetricsError::QuotaExceeded,
                StatusCode::FORBIDDEN if names_rate_limit(&body) => MetricsError::QuotaExceeded,
                StatusCode::UNAUTHORIZED => {
                    self.credentials.invalidate(owner).await;
                    MetricsError::Unauthorized(truncate_text(&body, 200))
                }
                _ => MetricsError::Status {
                    status: status.as_u16(),
                    body: truncate_text(&body, 200),
                },
            });
        }

        let report: ReportResponse = response
            .json()
            .await
            .map_err(|e| MetricsError::Decode(e.to_string()))?;

        let rows = parse_rows(&report)?;
        debug!(
            target_resource = %target_resource,
            rows = rows.len(),
            "Analytics report received"
        );
        Ok(rows)
    }
}

/// Convert report rows to metrics, locating columns by header name
fn parse_rows(report: &ReportResponse) -> Result<Vec<MetricsRow>, MetricsError> {
    let column = |name: &str| {
        report
            .column_headers
            .iter()
            .position(|h| h.name == name)
            .ok_or_else(|| MetricsError::Decode(format!("missing column '{name}'")))
    };

    if report.rows.is_empty() {
        return Ok(Vec::new());
    }

    let views = column("views")?;
    let minutes = column("estimatedMinutesWatched")?;
    let duration = column("averageViewDuration")?;
    let likes = column("likes")?;
    let comments = column("comments")?;

    report
        .rows
        .iter()
        .map(|row| {
            let number = |idx: usize| {
                row.get(idx)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| MetricsError::Decode(format!("non-numeric value at column {idx}")))
            };
            Ok(MetricsRow {
                views: number(views)? as u64,
                estimated_minutes_watched: number(minutes)?,
                average_view_duration: number(duration)?,
                likes: number(likes)? as u64,
                comments: number(comments)? as u64,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(json: &str) -> ReportResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_rows_by_header() {
        let r = report(
            r#"{
                "columnHeaders": [
                    {"name": "video"}, {"name": "views"}, {"name": "estimatedMinutesWatched"},
                    {"name": "averageViewDuration"}, {"name": "likes"}, {"name": "comments"}
                ],
                "rows": [["abc", 120, 300.5, 42, 7, 2]]
            }"#,
        );

        let rows = parse_rows(&r).unwrap();
        assert_eq!(
            rows,
            vec![MetricsRow {
                views: 120,
                estimated_minutes_watched: 300.5,
                average_view_duration: 42.0,
                likes: 7,
                comments: 2,
            }]
        );
    }

    #[test]
    fn test_parse_empty_report() {
        let r = report(r#"{"columnHeaders": [{"name": "video"}]}"#);
        assert!(parse_rows(&r).unwrap().is_empty());
    }

    #[test]
    fn test_parse_missing_column() {
        let r = report(r#"{"columnHeaders": [{"name": "video"}], "rows": [["abc"]]}"#);
        assert!(matches!(parse_rows(&r), Err(MetricsError::Decode(_))));
    }
}
