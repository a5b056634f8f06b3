// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wall clock sources and cloud-offset correction.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of epoch milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    /// Jump to `now_ms`.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Device clock corrected by the cloud session's offset estimate.
///
/// The offset is applied only when its magnitude exceeds the threshold, so a
/// device whose clock is already NTP-synchronized is left alone.
#[derive(Debug)]
pub struct CorrectedClock {
    source: Arc<dyn Clock>,
    offset_ms: AtomicI64,
    threshold_ms: i64,
}

impl CorrectedClock {
    /// Wrap `source` with the given threshold.
    pub fn new(source: Arc<dyn Clock>, threshold_ms: i64) -> Self {
        Self {
            source,
            offset_ms: AtomicI64::new(0),
            threshold_ms,
        }
    }

    /// Record the latest offset estimate.
    pub fn set_offset(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Latest offset estimate, applied or not.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Uncorrected local time.
    pub fn local_ms(&self) -> i64 {
        self.source.now_ms()
    }

    /// Corrected time.
    pub fn now_ms(&self) -> i64 {
        let now = self.source.now_ms();
        let offset = self.offset_ms();
        if offset.abs() > self.threshold_ms {
            now + offset
        } else {
            now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_offset_is_ignored() {
        let clock = CorrectedClock::new(Arc::new(ManualClock::new(1_000)), 50);
        clock.set_offset(50);
        assert_eq!(clock.now_ms(), 1_000);
        clock.set_offset(-50);
        assert_eq!(clock.now_ms(), 1_000);
    }

    #[test]
    fn test_large_offset_is_applied() {
        let source = Arc::new(ManualClock::new(1_000));
        let clock = CorrectedClock::new(source.clone(), 50);
        clock.set_offset(51);
        assert_eq!(clock.now_ms(), 1_051);
        clock.set_offset(-400);
        assert_eq!(clock.now_ms(), 600);

        source.advance(100);
        assert_eq!(clock.now_ms(), 700);
        assert_eq!(clock.local_ms(), 1_100);
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
