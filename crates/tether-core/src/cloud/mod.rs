// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session with the cloud actor that owns this device.
//!
//! The session moves replica diffs up and snapshots down:
//!
//! | Call | Direction | Payload |
//! |------|-----------|---------|
//! | `resume` | ← | both replicas, on every runtime start |
//! | `sync` | → / ← | `toCloud` diff up, `fromCloud` snapshot down |
//! | notification | ← | out-of-band nudge, triggers a full-cycle pulse |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_replica::Changes;
use tokio::sync::broadcast;

use crate::error::CloudError;

#[cfg(feature = "http")]
mod http;
mod loopback;

#[cfg(feature = "http")]
pub use http::HttpCloudSession;
pub use loopback::LoopbackCloud;

/// Channel carrying bundles from the cloud actor to the device.
pub const FROM_CLOUD_CHANNEL: &str = "fromCloudChannel";

/// Channel carrying [`BundleAck`]s back to the cloud actor.
pub const FROM_CLOUD_REPLY_CHANNEL: &str = "fromCloudReplyChannel";

/// Both replicas as stored by the cloud actor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSnapshot {
    /// Last `toCloud` state the cloud actor saw.
    pub to_cloud: Changes,
    /// Current `fromCloud` state.
    pub from_cloud: Changes,
}

/// Device's verdict on one bundle received from the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAck {
    /// Channel index of the bundle.
    pub index: u64,
    /// Whether the scheduler accepted it.
    pub result: bool,
}

/// Pushed by the cloud actor outside the sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Something changed, sync soon.
    Message(Value),
    /// The session is gone.
    Closed,
}

/// Connection to the cloud actor.
#[async_trait]
pub trait CloudSession: Send + Sync {
    /// Fetch both replicas so the device can start from the cloud's view.
    async fn resume(&self) -> Result<ResumeSnapshot, CloudError>;

    /// Upload a `toCloud` diff and receive a full `fromCloud` snapshot.
    async fn sync(&self, to_cloud: Changes) -> Result<Changes, CloudError>;

    /// Estimated `cloud_time - local_time` in milliseconds.
    fn estimated_time_offset_ms(&self) -> i64;

    /// Subscribe to notifications.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;

    /// Close the session.
    async fn close(&self) -> Result<(), CloudError>;
}
