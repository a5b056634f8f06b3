// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process cloud actor.
//!
//! Holds the cloud's side of both replicas in memory. Used by the demo binary
//! when no cloud URL is configured, and by tests to drive the device through
//! bundles, notifications and injected sync failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tether_replica::{Changes, SharedMap, channel};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{
    BundleAck, CloudSession, FROM_CLOUD_CHANNEL, FROM_CLOUD_REPLY_CHANNEL, Notification,
    ResumeSnapshot,
};
use crate::bundle::Bundle;
use crate::error::CloudError;

/// Acknowledgements kept by the cloud side.
pub const LOOPBACK_MAX_ACKS: usize = 10;

#[derive(Default)]
struct CloudState {
    /// The cloud's copy of the device's `toCloud` replica.
    to_cloud: SharedMap,
    /// The cloud-owned `fromCloud` replica.
    from_cloud: SharedMap,
    acks: VecDeque<BundleAck>,
    failures: VecDeque<CloudError>,
    closed: bool,
}

struct Shared {
    state: Mutex<CloudState>,
    notifications: broadcast::Sender<Notification>,
    offset_ms: AtomicI64,
    syncs: AtomicU64,
}

/// In-memory cloud actor for a single device.
#[derive(Clone)]
pub struct LoopbackCloud {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LoopbackCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackCloud")
            .field("syncs", &self.sync_count())
            .field("offset_ms", &self.shared.offset_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for LoopbackCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCloud {
    /// Create an empty cloud actor.
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CloudState::default()),
                notifications,
                offset_ms: AtomicI64::new(0),
                syncs: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update_from_cloud<T>(
        &self,
        f: impl FnOnce(&mut tether_replica::MapRef) -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        let mut state = self.lock();
        let mut out = state.from_cloud.reference();
        let result = f(&mut out)?;
        out.prepare();
        state
            .from_cloud
            .commit(&out)
            .map_err(|e| CloudError::Rejected(e.to_string()))?;
        Ok(result)
    }

    /// Queue a frozen bundle for the device. Returns its channel index.
    pub fn send_bundle(&self, bundle: &Bundle) -> Result<u64, CloudError> {
        let value = bundle
            .to_value()
            .map_err(|e| CloudError::Rejected(e.to_string()))?;
        let index = self.update_from_cloud(|out| {
            channel::send(out, FROM_CLOUD_CHANNEL, vec![value])
                .map_err(|e| CloudError::Rejected(e.to_string()))
        })?;
        debug!(index, "Loopback cloud queued bundle");
        Ok(index)
    }

    /// Set a plain value in the `fromCloud` replica.
    pub fn set_value(&self, key: &str, value: Value) -> Result<(), CloudError> {
        self.update_from_cloud(|out| {
            out.set(key, value)
                .map_err(|e| CloudError::Rejected(e.to_string()))
        })
    }

    /// Push a notification, nudging the device to sync now.
    pub fn notify(&self, payload: Value) {
        let _ = self.shared.notifications.send(Notification::Message(payload));
    }

    /// Fail the next sync with `error`. Failures queue up.
    pub fn fail_next_sync(&self, error: CloudError) {
        self.lock().failures.push_back(error);
    }

    /// Set the clock offset the device will be told about.
    pub fn set_time_offset_ms(&self, offset_ms: i64) {
        self.shared.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Acknowledgements received from the device, oldest first.
    pub fn acks(&self) -> Vec<BundleAck> {
        self.lock().acks.iter().copied().collect()
    }

    /// A value the device published in its `toCloud` replica.
    pub fn device_value(&self, key: &str) -> Option<Value> {
        self.lock().to_cloud.get(key).cloned()
    }

    /// Version of the cloud's copy of the device replica.
    pub fn device_version(&self) -> u64 {
        self.lock().to_cloud.version()
    }

    /// Accept a new session after [`close`](CloudSession::close).
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Sync attempts so far, failed ones included.
    pub fn sync_count(&self) -> u64 {
        self.shared.syncs.load(Ordering::SeqCst)
    }

    /// Bundles still held in the downlink channel.
    pub fn undelivered(&self) -> usize {
        self.lock()
            .from_cloud
            .get(FROM_CLOUD_CHANNEL)
            .and_then(|entry| entry.get("values"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl CloudSession for LoopbackCloud {
    async fn resume(&self) -> Result<ResumeSnapshot, CloudError> {
        let state = self.lock();
        if state.closed {
            return Err(CloudError::Closed);
        }
        Ok(ResumeSnapshot {
            to_cloud: state.to_cloud.snapshot(),
            from_cloud: state.from_cloud.snapshot(),
        })
    }

    async fn sync(&self, to_cloud: Changes) -> Result<Changes, CloudError> {
        let mut guard = self.lock();
        self.shared.syncs.fetch_add(1, Ordering::SeqCst);
        if guard.closed {
            return Err(CloudError::Closed);
        }
        if let Some(err) = guard.failures.pop_front() {
            debug!(error = %err, "Loopback cloud injecting sync failure");
            return Err(err);
        }

        let state = &mut *guard;
        state
            .to_cloud
            .apply_changes(&to_cloud)
            .map_err(|e| CloudError::Rejected(e.to_string()))?;

        let device_view = state.to_cloud.reference_read_only();
        let mut out = state.from_cloud.reference();
        let received = channel::receive(&mut out, &device_view, FROM_CLOUD_REPLY_CHANNEL)
            .map_err(|e| CloudError::Rejected(e.to_string()))?;
        for raw in received.messages {
            match serde_json::from_value::<BundleAck>(raw) {
                Ok(ack) => {
                    if state.acks.len() == LOOPBACK_MAX_ACKS {
                        state.acks.pop_front();
                    }
                    state.acks.push_back(ack);
                }
                Err(e) => warn!(error = %e, "Ignoring malformed bundle ack"),
            }
        }
        channel::gc(&mut out, &device_view).map_err(|e| CloudError::Rejected(e.to_string()))?;
        out.prepare();
        state
            .from_cloud
            .commit(&out)
            .map_err(|e| CloudError::Rejected(e.to_string()))?;

        Ok(state.from_cloud.snapshot())
    }

    fn estimated_time_offset_ms(&self) -> i64 {
        self.shared.offset_ms.load(Ordering::Relaxed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    async fn close(&self) -> Result<(), CloudError> {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            let _ = self.shared.notifications.send(Notification::Closed);
        }
        Ok(())
    }
}
