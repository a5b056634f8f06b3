// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bundle scheduler.
//!
//! Accepted bundles wait as `Pending` until their start time, then become the
//! single `Active` bundle and fire their commands onto the message queue.
//!
//! ```text
//! submit ──► Pending ──(start)──► Active ──(last command)──► Completed
//!    │                              │
//!    │                              └──(another bundle activates)──► Superseded
//!    └──(late or stale)──► Rejected
//! ```
//!
//! All bookkeeping sits behind one mutex. Timer callbacks take it once and
//! enqueue while holding it, so no command of a superseded bundle can slip
//! onto the queue after the newer bundle activated.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bundle::{Bundle, BundleId, Command, Start};
use crate::clock::CorrectedClock;
use crate::queue::{EnqueueOptions, QueueHandle};

/// Terminal outcomes remembered for introspection.
pub const HISTORY_LIMIT: usize = 64;

/// Lifecycle state of a submitted bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleState {
    /// Waiting for its start time.
    Pending,
    /// Firing commands.
    Active,
    /// Every command was enqueued.
    Completed,
    /// Cancelled by a newer bundle.
    Superseded,
    /// Refused at submission.
    Rejected,
}

impl BundleState {
    /// True for states a bundle never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Superseded | Self::Rejected)
    }
}

struct ScheduledBundle {
    commands: Vec<Command>,
    start_ms: i64,
    state: BundleState,
    activation: Option<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
}

impl ScheduledBundle {
    fn cancel(&mut self) {
        if let Some(handle) = self.activation.take() {
            handle.abort();
        }
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    bundles: HashMap<BundleId, ScheduledBundle>,
    active: Option<BundleId>,
    history: VecDeque<(BundleId, BundleState)>,
    stopped: bool,
}

impl Inner {
    fn record(&mut self, id: BundleId, state: BundleState) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((id, state));
    }
}

/// Cloneable handle to the device's bundle scheduler.
#[derive(Clone)]
pub struct BundleScheduler {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<CorrectedClock>,
    queue: QueueHandle,
}

impl std::fmt::Debug for BundleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BundleScheduler")
            .field("tracked", &inner.bundles.len())
            .field("active", &inner.active)
            .field("stopped", &inner.stopped)
            .finish()
    }
}

impl BundleScheduler {
    /// Create a scheduler that enqueues commands on `queue`.
    pub fn new(clock: Arc<CorrectedClock>, queue: QueueHandle) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            queue,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cloud-corrected current time.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn reject(&self, id: BundleId, reason: &'static str, start_ms: i64, now_ms: i64) -> bool {
        debug!(bundle_id = %id, start_ms, now_ms, reason, "Ignoring bundle");
        self.lock().record(id, BundleState::Rejected);
        false
    }

    /// Accept a frozen bundle for execution.
    ///
    /// Returns `false` if the bundle is late, stale, not frozen, or the
    /// scheduler was stopped. Resubmitting a bundle that is still pending or
    /// active is accepted without scheduling it twice.
    pub fn submit(&self, bundle: &Bundle) -> bool {
        if !bundle.is_frozen() {
            debug!("Ignoring bundle that was never frozen");
            return false;
        }
        let (id, start) = match (bundle.id(), bundle.start()) {
            (Ok(id), Some(start)) => (id, start),
            (Err(e), _) => {
                debug!(error = %e, "Ignoring bundle without identity");
                return false;
            }
            (Ok(_), None) => return false,
        };

        let now = self.clock.now_ms();
        let start_ms = match start {
            Start::Now => now,
            Start::NowSafe { deadline_ms } if now > deadline_ms => {
                return self.reject(id, "stale", deadline_ms, now);
            }
            Start::NowSafe { .. } => now,
            Start::At(t) if t < now => return self.reject(id, "late", t, now),
            Start::At(t) => t,
        };

        let mut inner = self.lock();
        if inner.stopped {
            debug!(bundle_id = %id, "Scheduler stopped, ignoring bundle");
            return false;
        }
        if inner.bundles.contains_key(&id) {
            debug!(bundle_id = %id, "Bundle already scheduled");
            return true;
        }

        let delay = Duration::from_millis(start_ms.saturating_sub(now).max(0) as u64);
        let scheduler = self.clone();
        let task_id = id.clone();
        let activation = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.activate(&task_id);
        });

        debug!(
            bundle_id = %id,
            start_ms,
            delay_ms = delay.as_millis() as u64,
            commands = bundle.commands().len(),
            "Bundle scheduled"
        );
        inner.bundles.insert(
            id,
            ScheduledBundle {
                commands: bundle.commands().to_vec(),
                start_ms,
                state: BundleState::Pending,
                activation: Some(activation),
                driver: None,
            },
        );
        true
    }

    fn activate(&self, id: &BundleId) {
        let mut inner = self.lock();
        if !inner.bundles.contains_key(id) {
            return;
        }

        if let Some(previous) = inner.active.take() {
            if let Some(mut old) = inner.bundles.remove(&previous) {
                old.cancel();
                info!(bundle_id = %previous, superseded_by = %id, "Bundle superseded");
                inner.record(previous, BundleState::Superseded);
            }
        }

        let Some(scheduled) = inner.bundles.get_mut(id) else {
            return;
        };
        // Dropping our own handle detaches; this task is about to finish anyway.
        scheduled.activation = None;

        if scheduled.commands.is_empty() {
            inner.bundles.remove(id);
            inner.record(id.clone(), BundleState::Completed);
            return;
        }

        let mut elapsed = 0u64;
        let offsets: Vec<u64> = scheduled
            .commands
            .iter()
            .map(|command| {
                elapsed = elapsed.saturating_add(command.after);
                elapsed
            })
            .collect();

        let activated_at = Instant::now();
        let scheduler = self.clone();
        let task_id = id.clone();
        scheduled.driver = Some(tokio::spawn(async move {
            for (index, offset) in offsets.into_iter().enumerate() {
                match activated_at.checked_add(Duration::from_millis(offset)) {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
                if !scheduler.fire(&task_id, index) {
                    break;
                }
            }
        }));
        scheduled.state = BundleState::Active;
        debug!(bundle_id = %id, start_ms = scheduled.start_ms, "Bundle activated");
        inner.active = Some(id.clone());
    }

    /// Enqueue command `index` of the active bundle. Returns false when done.
    fn fire(&self, id: &BundleId, index: usize) -> bool {
        let mut inner = self.lock();
        if inner.active.as_ref() != Some(id) {
            return false;
        }
        let Some(scheduled) = inner.bundles.get(id) else {
            return false;
        };
        let Some(command) = scheduled.commands.get(index).cloned() else {
            return false;
        };
        let last = index + 1 == scheduled.commands.len();

        if let Err(e) =
            self.queue
                .enqueue_detached(command.method.clone(), command.args, EnqueueOptions::default())
        {
            debug!(method = %command.method, error = %e, "Exception in bundle command");
        }

        if last {
            inner.bundles.remove(id);
            inner.active = None;
            inner.record(id.clone(), BundleState::Completed);
            debug!(bundle_id = %id, "Bundle completed");
        }
        !last
    }

    /// Cancel every timer of every tracked bundle and refuse further bundles.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        let cancelled = inner.bundles.len();
        for scheduled in inner.bundles.values_mut() {
            scheduled.cancel();
        }
        inner.bundles.clear();
        inner.active = None;
        if cancelled > 0 {
            info!(cancelled, "Bundle scheduler stopped");
        }
    }

    /// True once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// State of a bundle, tracked or recently finished.
    pub fn state(&self, id: &BundleId) -> Option<BundleState> {
        let inner = self.lock();
        if let Some(scheduled) = inner.bundles.get(id) {
            return Some(scheduled.state);
        }
        inner
            .history
            .iter()
            .rev()
            .find(|(other, _)| other == id)
            .map(|(_, state)| *state)
    }

    /// The active bundle, if any.
    pub fn active(&self) -> Option<BundleId> {
        self.lock().active.clone()
    }

    /// Number of bundles waiting for their start time.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .bundles
            .values()
            .filter(|b| b.state == BundleState::Pending)
            .count()
    }

    /// Recent terminal outcomes, oldest first.
    pub fn history(&self) -> Vec<(BundleId, BundleState)> {
        self.lock().history.iter().cloned().collect()
    }
}
