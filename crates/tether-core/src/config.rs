// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bundle::{Bundle, StartHint};
use crate::nap::{DEFAULT_NAP_MAILBOX_FILE, NapMailbox};

/// Default safety margin added to bundle start times.
pub const DEFAULT_BUNDLE_MARGIN_MS: u64 = 2000;
/// Clock offsets at or below this magnitude are ignored.
pub const DEFAULT_CLOCK_OFFSET_THRESHOLD_MS: i64 = 50;
/// Default pulse interval.
pub const DEFAULT_PULSE_INTERVAL_MS: u64 = 1000;
/// Default number of bundle acknowledgements kept in memory.
pub const DEFAULT_ACK_HISTORY_SIZE: usize = 16;
/// Default window after which a `NOW_SAFE` bundle is considered stale.
pub const DEFAULT_NOW_SAFE_STALENESS_MS: u64 = 5000;
/// Default liveness check period.
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 10_000;

/// Tunables consumed by the device runtime kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    /// Safety margin added to bundle start times, in milliseconds.
    pub bundle_margin_ms: u64,
    /// Cloud clock offsets smaller than this are not applied.
    pub clock_offset_threshold_ms: i64,
    /// Interval of the `pulseCron` timer.
    pub pulse_interval: Duration,
    /// Number of bundle acknowledgements kept by the sync engine.
    pub ack_history_size: usize,
    /// Staleness window used for `NOW_SAFE` bundles, in milliseconds.
    pub now_safe_staleness_ms: u64,
    /// Period of the liveness watchdog.
    pub watchdog_interval: Duration,
    /// Directory of the halt-and-restart mailbox. `None` disables requests.
    pub nap_mailbox_dir: Option<PathBuf>,
    /// File name of the halt-and-restart mailbox.
    pub nap_mailbox_file: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bundle_margin_ms: DEFAULT_BUNDLE_MARGIN_MS,
            clock_offset_threshold_ms: DEFAULT_CLOCK_OFFSET_THRESHOLD_MS,
            pulse_interval: Duration::from_millis(DEFAULT_PULSE_INTERVAL_MS),
            ack_history_size: DEFAULT_ACK_HISTORY_SIZE,
            now_safe_staleness_ms: DEFAULT_NOW_SAFE_STALENESS_MS,
            watchdog_interval: Duration::from_millis(DEFAULT_WATCHDOG_INTERVAL_MS),
            nap_mailbox_dir: None,
            nap_mailbox_file: DEFAULT_NAP_MAILBOX_FILE.to_string(),
        }
    }
}

fn env_or<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

impl KernelConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TETHER_BUNDLE_MARGIN_MS`: bundle margin (default: 2000)
    /// - `TETHER_CLOCK_OFFSET_THRESHOLD_MS`: ignored clock offset (default: 50)
    /// - `TETHER_PULSE_INTERVAL_MS`: pulse interval (default: 1000)
    /// - `TETHER_ACK_HISTORY_SIZE`: kept acknowledgements (default: 16)
    /// - `TETHER_NOW_SAFE_STALENESS_MS`: NOW_SAFE window (default: 5000)
    /// - `TETHER_WATCHDOG_INTERVAL_MS`: liveness check period (default: 10000)
    /// - `TETHER_NAP_MAILBOX_DIR`: halt-and-restart mailbox directory (default: disabled)
    /// - `TETHER_NAP_MAILBOX_FILE`: halt-and-restart mailbox file (default: nap.json)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bundle_margin_ms = env_or(
            "TETHER_BUNDLE_MARGIN_MS",
            DEFAULT_BUNDLE_MARGIN_MS,
            "must be a non-negative integer",
        )?;

        let clock_offset_threshold_ms: i64 = env_or(
            "TETHER_CLOCK_OFFSET_THRESHOLD_MS",
            DEFAULT_CLOCK_OFFSET_THRESHOLD_MS,
            "must be an integer",
        )?;
        if clock_offset_threshold_ms < 0 {
            return Err(ConfigError::Invalid(
                "TETHER_CLOCK_OFFSET_THRESHOLD_MS",
                "must not be negative",
            ));
        }

        let pulse_interval_ms: u64 = env_or(
            "TETHER_PULSE_INTERVAL_MS",
            DEFAULT_PULSE_INTERVAL_MS,
            "must be a positive integer",
        )?;
        if pulse_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_PULSE_INTERVAL_MS",
                "must be a positive integer",
            ));
        }

        let ack_history_size: usize = env_or(
            "TETHER_ACK_HISTORY_SIZE",
            DEFAULT_ACK_HISTORY_SIZE,
            "must be a positive integer",
        )?;
        if ack_history_size == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_ACK_HISTORY_SIZE",
                "must be a positive integer",
            ));
        }

        let now_safe_staleness_ms = env_or(
            "TETHER_NOW_SAFE_STALENESS_MS",
            DEFAULT_NOW_SAFE_STALENESS_MS,
            "must be a non-negative integer",
        )?;

        let watchdog_interval_ms: u64 = env_or(
            "TETHER_WATCHDOG_INTERVAL_MS",
            DEFAULT_WATCHDOG_INTERVAL_MS,
            "must be a positive integer",
        )?;
        if watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_WATCHDOG_INTERVAL_MS",
                "must be a positive integer",
            ));
        }

        let nap_mailbox_dir = std::env::var("TETHER_NAP_MAILBOX_DIR")
            .ok()
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        let nap_mailbox_file = match std::env::var("TETHER_NAP_MAILBOX_FILE") {
            Ok(file) if file.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "TETHER_NAP_MAILBOX_FILE",
                    "must not be empty",
                ));
            }
            Ok(file) => file.trim().to_string(),
            Err(_) => DEFAULT_NAP_MAILBOX_FILE.to_string(),
        };

        Ok(Self {
            bundle_margin_ms,
            clock_offset_threshold_ms,
            pulse_interval: Duration::from_millis(pulse_interval_ms),
            ack_history_size,
            now_safe_staleness_ms,
            watchdog_interval: Duration::from_millis(watchdog_interval_ms),
            nap_mailbox_dir,
            nap_mailbox_file,
        })
    }

    /// Set the bundle margin in milliseconds.
    pub fn with_bundle_margin_ms(mut self, margin_ms: u64) -> Self {
        self.bundle_margin_ms = margin_ms;
        self
    }

    /// Set the clock offset threshold in milliseconds.
    pub fn with_clock_offset_threshold_ms(mut self, threshold_ms: i64) -> Self {
        self.clock_offset_threshold_ms = threshold_ms;
        self
    }

    /// Set the pulse interval.
    pub fn with_pulse_interval(mut self, interval: Duration) -> Self {
        self.pulse_interval = interval;
        self
    }

    /// Set the number of acknowledgements kept by the sync engine.
    pub fn with_ack_history_size(mut self, size: usize) -> Self {
        self.ack_history_size = size.max(1);
        self
    }

    /// Set the `NOW_SAFE` staleness window in milliseconds.
    pub fn with_now_safe_staleness_ms(mut self, staleness_ms: u64) -> Self {
        self.now_safe_staleness_ms = staleness_ms;
        self
    }

    /// Set the liveness watchdog period.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Enable halt-and-restart requests through `dir/file`.
    pub fn with_nap_mailbox(mut self, dir: impl Into<PathBuf>, file: impl Into<String>) -> Self {
        self.nap_mailbox_dir = Some(dir.into());
        self.nap_mailbox_file = file.into();
        self
    }

    /// The halt-and-restart mailbox, if configured.
    pub fn nap_mailbox(&self) -> Option<NapMailbox> {
        self.nap_mailbox_dir
            .as_ref()
            .map(|dir| NapMailbox::new(dir, &self.nap_mailbox_file))
    }

    /// A new empty bundle using the configured margin.
    pub fn new_bundle(&self) -> Bundle {
        Bundle::new(self.bundle_margin_ms)
    }

    /// Start hint for a bundle that must run now or not at all.
    pub fn now_safe(&self) -> StartHint {
        StartHint::NowSafe {
            staleness_ms: self.now_safe_staleness_ms,
        }
    }
}

/// Settings read only by the `tether-device` binary.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Identifier of this device at the cloud actor.
    pub device_id: String,
    /// Base URL of the cloud actor. `None` runs against an in-process loopback.
    pub cloud_url: Option<String>,
}

impl DeviceConfig {
    /// Load device settings from environment variables.
    ///
    /// Required:
    /// - `TETHER_DEVICE_ID`: device identifier
    ///
    /// Optional:
    /// - `TETHER_CLOUD_URL`: cloud actor base URL
    pub fn from_env() -> Result<Self, ConfigError> {
        let device_id = std::env::var("TETHER_DEVICE_ID")
            .map_err(|_| ConfigError::Missing("TETHER_DEVICE_ID"))?;
        if device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("TETHER_DEVICE_ID", "must not be empty"));
        }

        let cloud_url = std::env::var("TETHER_CLOUD_URL")
            .ok()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Ok(Self {
            device_id,
            cloud_url,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
