// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delayed halt-and-restart requests for the host supervisor.
//!
//! The device process cannot power-cycle the board itself. It drops a request
//! into a mailbox file watched by a privileged management daemon:
//!
//! ```json
//! {"op": "haltAndRestart", "when": "2025-01-01T00:00:30+00:00"}
//! ```
//!
//! A newer request overwrites an older one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Operation name understood by the management daemon.
pub const HALT_AND_RESTART_OP: &str = "haltAndRestart";

/// Default mailbox file name inside the mailbox directory.
pub const DEFAULT_NAP_MAILBOX_FILE: &str = "nap.json";

/// Contents of the mailbox file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NapRequest {
    /// Requested operation.
    pub op: String,
    /// When the board should come back, RFC 3339.
    pub when: String,
}

/// Mailbox file shared with the management daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NapMailbox {
    path: PathBuf,
}

impl NapMailbox {
    /// Mailbox at `dir/file`.
    pub fn new(dir: impl AsRef<Path>, file: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(file),
        }
    }

    /// Full path of the mailbox file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ask the supervisor to halt the board and restart it `after` from `now_ms`.
    ///
    /// Failures are logged and reported as `false`; the device keeps running
    /// either way.
    pub fn halt_and_restart(&self, after: Duration, now_ms: i64) -> bool {
        match self.write_request(after, now_ms) {
            Ok(request) => {
                info!(path = %self.path.display(), when = %request.when, "Requested halt and restart");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot haltAndRestart");
                false
            }
        }
    }

    fn write_request(&self, after: Duration, now_ms: i64) -> std::io::Result<NapRequest> {
        let after_ms = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
        let when = DateTime::<Utc>::from_timestamp_millis(now_ms.saturating_add(after_ms))
            .ok_or_else(|| std::io::Error::other("restart time out of range"))?;
        let request = NapRequest {
            op: HALT_AND_RESTART_OP.to_string(),
            when: when.to_rfc3339(),
        };
        let data = serde_json::to_vec(&request).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, data)?;
        Ok(request)
    }
}
