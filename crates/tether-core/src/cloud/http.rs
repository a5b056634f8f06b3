// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-over-HTTP cloud session.
//!
//! | Call | Request |
//! |------|---------|
//! | `resume` | `POST {base}/iot/{device_id}/resume` |
//! | `sync` | `POST {base}/iot/{device_id}` with `{toCloud, fromCloud: {version}}` |
//!
//! Both answer with `{fromCloud, serverTime?}`; `resume` adds `toCloud`.
//! HTTP has no push channel, so the only notification ever delivered is
//! [`Notification::Closed`] after [`close`](CloudSession::close).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_replica::Changes;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use super::{CloudSession, Notification, ResumeSnapshot};
use crate::error::CloudError;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest<'a> {
    to_cloud: &'a Changes,
    from_cloud: KnownVersion,
}

#[derive(Debug, Serialize)]
struct KnownVersion {
    version: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    from_cloud: Changes,
    #[serde(default)]
    server_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeResponse {
    to_cloud: Changes,
    from_cloud: Changes,
    #[serde(default)]
    server_time: Option<i64>,
}

/// Estimated `cloud - local` offset, assuming a symmetric round trip.
fn estimate_offset(server_time: i64, sent_ms: i64, received_ms: i64) -> i64 {
    let rtt = (received_ms - sent_ms).max(0);
    server_time + rtt / 2 - received_ms
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cloud session talking to a cloud actor over HTTP.
#[derive(Debug)]
pub struct HttpCloudSession {
    client: reqwest::Client,
    base_url: String,
    device_id: String,
    offset_ms: AtomicI64,
    from_cloud_version: AtomicU64,
    closed: AtomicBool,
    notifications: broadcast::Sender<Notification>,
}

impl HttpCloudSession {
    /// Create a session for `device_id` against `base_url`.
    pub fn new(base_url: impl Into<String>, device_id: impl Into<String>) -> Result<Self, CloudError> {
        Self::with_timeout(base_url, device_id, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a session with a custom per-request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        device_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        let (notifications, _) = broadcast::channel(8);
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_id: device_id.into(),
            offset_ms: AtomicI64::new(0),
            from_cloud_version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notifications,
        })
    }

    fn sync_url(&self) -> String {
        format!("{}/iot/{}", self.base_url, self.device_id)
    }

    fn resume_url(&self) -> String {
        format!("{}/resume", self.sync_url())
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, CloudError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned + TimedResponse,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CloudError::Closed);
        }

        let sent = now_ms();
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::Rejected(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        let parsed: R = response
            .json()
            .await
            .map_err(|e| CloudError::Protocol(e.to_string()))?;
        if let Some(server_time) = parsed.server_time() {
            let offset = estimate_offset(server_time, sent, now_ms());
            self.offset_ms.store(offset, Ordering::Relaxed);
        }
        Ok(parsed)
    }
}

trait TimedResponse {
    fn server_time(&self) -> Option<i64>;
}

impl TimedResponse for SyncResponse {
    fn server_time(&self) -> Option<i64> {
        self.server_time
    }
}

impl TimedResponse for ResumeResponse {
    fn server_time(&self) -> Option<i64> {
        self.server_time
    }
}

#[async_trait]
impl CloudSession for HttpCloudSession {
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    async fn resume(&self) -> Result<ResumeSnapshot, CloudError> {
        let response: ResumeResponse = self.post(&self.resume_url(), &serde_json::json!({})).await?;
        self.from_cloud_version
            .store(response.from_cloud.version, Ordering::SeqCst);
        Ok(ResumeSnapshot {
            to_cloud: response.to_cloud,
            from_cloud: response.from_cloud,
        })
    }

    async fn sync(&self, to_cloud: Changes) -> Result<Changes, CloudError> {
        let request = SyncRequest {
            to_cloud: &to_cloud,
            from_cloud: KnownVersion {
                version: self.from_cloud_version.load(Ordering::SeqCst),
            },
        };
        let response: SyncResponse = self.post(&self.sync_url(), &request).await?;
        debug!(
            to_cloud_version = to_cloud.version,
            from_cloud_version = response.from_cloud.version,
            "HTTP sync complete"
        );
        self.from_cloud_version
            .store(response.from_cloud.version, Ordering::SeqCst);
        Ok(response.from_cloud)
    }

    fn estimated_time_offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn close(&self) -> Result<(), CloudError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.notifications.send(Notification::Closed);
        }
        Ok(())
    }
}
