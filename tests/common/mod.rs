//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::{ImageFormat, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use thumbwheel::models::{Campaign, NewCampaign};
use thumbwheel::scheduler::{
    Cadence, CadenceUnit, DriverConfig, ExecutorConfig, PublishClient, PublishRequest,
    RotationExecutor, SchedulerDriver, VariantFetcher, VariantPayload,
};
use thumbwheel::storage::SharedCampaignStore;
use thumbwheel::utils::error::{FetchError, PublishError};
use thumbwheel::utils::retry::RetryConfig;

/// Fixed campaign start used across tests
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
}

/// Encode a blank PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    RgbImage::new(width, height)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Locator of variant `i`
pub fn variant_url(i: usize) -> String {
    format!("https://cdn.test/variant-{i}.png")
}

/// Campaign with `n` variants starting at `t0()`
pub fn campaign(n: usize, cadence: Cadence, window: Duration) -> Campaign {
    NewCampaign {
        owner: "owner@example.com".to_string(),
        target_resource: "video-123".to_string(),
        variants: (0..n).map(variant_url).collect(),
        window_start: t0(),
        window_end: t0() + window,
        cadence,
    }
    .into_campaign()
    .unwrap()
}

pub fn hourly() -> Cadence {
    Cadence::new(1, CadenceUnit::Hours)
}

/// Serves a valid 1280x720 PNG for any locator
pub struct PngFetcher {
    png: Bytes,
    pub calls: AtomicUsize,
}

impl PngFetcher {
    pub fn new() -> Self {
        Self {
            png: Bytes::from(png_bytes(1280, 720)),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VariantFetcher for PngFetcher {
    async fn fetch_bytes(&self, _locator: &str) -> Result<VariantPayload, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VariantPayload {
            bytes: self.png.clone(),
            mime_type: "image/png".to_string(),
        })
    }
}

/// Payloads keyed by locator; unknown locators are `NotFound`
pub struct MapFetcher {
    payloads: HashMap<String, VariantPayload>,
}

impl MapFetcher {
    pub fn new(payloads: Vec<(String, Vec<u8>, &str)>) -> Self {
        Self {
            payloads: payloads
                .into_iter()
                .map(|(locator, bytes, mime)| {
                    (
                        locator,
                        VariantPayload {
                            bytes: Bytes::from(bytes),
                            mime_type: mime.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl VariantFetcher for MapFetcher {
    async fn fetch_bytes(&self, locator: &str) -> Result<VariantPayload, FetchError> {
        self.payloads
            .get(locator)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(locator.to_string()))
    }
}

/// Publisher that replays scripted results, then succeeds
#[derive(Default)]
pub struct RecordingPublisher {
    script: Mutex<VecDeque<Result<(), PublishError>>>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(results: Vec<Result<(), PublishError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of publish calls made
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Target and payload size of every call, in order
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishClient for RecordingPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.target_resource.clone(), request.bytes.len()));
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Publisher that blocks until released, for overlapping-tick tests
#[derive(Default)]
pub struct GatedPublisher {
    pub entered: Notify,
    pub release: Notify,
    pub calls: AtomicUsize,
}

#[async_trait]
impl PublishClient for GatedPublisher {
    async fn publish(&self, _request: &PublishRequest) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Executor settings with short, observable backoff
pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        retry: RetryConfig::with_delays(3, 100, 1_000),
        ..Default::default()
    }
}

/// Driver settings without pacing
pub fn unpaced_driver_config() -> DriverConfig {
    DriverConfig {
        pacing: std::time::Duration::ZERO,
        ..Default::default()
    }
}

/// Driver over the given store and collaborators
pub fn driver(
    store: SharedCampaignStore,
    fetcher: Arc<dyn VariantFetcher>,
    publisher: Arc<dyn PublishClient>,
    config: DriverConfig,
) -> SchedulerDriver {
    let executor = RotationExecutor::new(fetcher, publisher, fast_executor_config());
    SchedulerDriver::new(store, executor, config).unwrap()
}
