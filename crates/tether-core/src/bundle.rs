// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bundles of time-ordered device commands.
//!
//! A bundle is built by appending commands, then frozen with a start time.
//! Only frozen bundles are serialized and shipped to the device.
//!
//! # Wire format
//!
//! ```json
//! {"start": 1700000000000, "commands": [{"after": 0, "method": "down", "args": [1]}]}
//! ```
//!
//! | `start` | Meaning |
//! |---------|---------|
//! | `-1` | `NOW`: start on arrival |
//! | `< -1` | `NOW_SAFE`: start on arrival unless later than the deadline `-start` |
//! | `>= 0` | absolute epoch milliseconds |
//!
//! The bundle id is the lowercase hex SHA-256 of this serialized form, so
//! structurally identical bundles share an id.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::DEFAULT_BUNDLE_MARGIN_MS;
use crate::error::BundleError;

/// Result type using BundleError
pub type Result<T> = std::result::Result<T, BundleError>;

/// Wire value of the `NOW` sentinel.
pub const NOW: i64 = -1;

/// One delayed method call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Delay in milliseconds after the previous command (or after activation).
    pub after: u64,
    /// Device method to call.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Resolved start of a frozen bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Start when the device receives it.
    Now,
    /// Start on arrival unless the device clock is past `deadline_ms`.
    NowSafe {
        /// Epoch milliseconds after which the bundle is stale.
        deadline_ms: i64,
    },
    /// Start at an absolute epoch time.
    At(i64),
}

impl Start {
    /// Encode as the wire integer.
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Now => NOW,
            Self::NowSafe { deadline_ms } => -deadline_ms.max(2),
            Self::At(t) => t,
        }
    }

    /// Decode the wire integer.
    pub fn from_wire(start: i64) -> Result<Self> {
        match start {
            NOW => Ok(Self::Now),
            s if s < NOW => s
                .checked_neg()
                .map(|deadline_ms| Self::NowSafe { deadline_ms })
                .ok_or_else(|| BundleError::Parse(format!("start {s} out of range"))),
            s => Ok(Self::At(s)),
        }
    }
}

/// Start requested when freezing a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartHint {
    /// Resolve to the device's time at activation.
    Now,
    /// Like `Now`, but discarded if it reaches the device after `staleness_ms`.
    NowSafe {
        /// Window, measured from freeze time.
        staleness_ms: u64,
    },
    /// Start at this epoch time plus the margin.
    At(i64),
    /// Start at the current time plus the margin.
    Current,
}

/// Content-hash identity of a frozen bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct WireBundle {
    start: i64,
    commands: Vec<Command>,
}

/// A sequence of delayed commands with a start time.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    start: Option<Start>,
    commands: Vec<Command>,
    margin_ms: u64,
    methods: Arc<BTreeSet<String>>,
    frozen: bool,
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new(DEFAULT_BUNDLE_MARGIN_MS)
    }
}

impl Bundle {
    /// Create an empty, mutable bundle that accepts any method.
    pub fn new(margin_ms: u64) -> Self {
        Self {
            start: None,
            commands: Vec::new(),
            margin_ms,
            methods: Arc::new(BTreeSet::new()),
            frozen: false,
        }
    }

    /// Create an empty bundle restricted to `methods`.
    ///
    /// An empty list places no restriction.
    pub fn with_methods<I, S>(methods: I, margin_ms: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: Arc::new(methods.into_iter().map(Into::into).collect()),
            ..Self::new(margin_ms)
        }
    }

    /// Append a command `after_ms` after the previous one.
    pub fn append(
        &mut self,
        method: impl Into<String>,
        after_ms: u64,
        args: Vec<Value>,
    ) -> Result<&mut Self> {
        if self.frozen {
            return Err(BundleError::Frozen);
        }
        let method = method.into();
        if !self.methods.is_empty() && !self.methods.contains(&method) {
            return Err(BundleError::UnknownMethod(method));
        }
        self.commands.push(Command {
            after: after_ms,
            method,
            args,
        });
        Ok(self)
    }

    /// Fix the start time using the host clock and freeze the bundle.
    pub fn freeze(&mut self, hint: StartHint) -> Result<&mut Self> {
        self.freeze_at(hint, chrono::Utc::now().timestamp_millis())
    }

    /// Fix the start time relative to `now_ms` and freeze the bundle.
    pub fn freeze_at(&mut self, hint: StartHint, now_ms: i64) -> Result<&mut Self> {
        if self.frozen {
            return Err(BundleError::AlreadyFrozen);
        }
        let margin = i64::try_from(self.margin_ms).unwrap_or(i64::MAX);
        self.start = Some(match hint {
            StartHint::Now => Start::Now,
            StartHint::NowSafe { staleness_ms } => Start::NowSafe {
                deadline_ms: now_ms
                    .saturating_add(i64::try_from(staleness_ms).unwrap_or(i64::MAX)),
            },
            StartHint::At(t) => Start::At(t.saturating_add(margin)),
            StartHint::Current => Start::At(now_ms.saturating_add(margin)),
        });
        self.frozen = true;
        Ok(self)
    }

    /// Encode the wire form. Fails if no start time was fixed.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_wire()?).map_err(|e| BundleError::Parse(e.to_string()))
    }

    /// Encode the wire form as a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self.to_wire()?).map_err(|e| BundleError::Parse(e.to_string()))
    }

    fn to_wire(&self) -> Result<WireBundle> {
        let start = self.start.ok_or(BundleError::StartUnset)?;
        Ok(WireBundle {
            start: start.to_wire(),
            commands: self.commands.clone(),
        })
    }

    /// Decode a frozen bundle from its wire form.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let wire: WireBundle =
            serde_json::from_slice(bytes).map_err(|e| BundleError::Parse(e.to_string()))?;
        Self::from_wire(wire)
    }

    /// Decode a frozen bundle from a JSON value, as delivered on a channel.
    pub fn from_value(value: Value) -> Result<Self> {
        let wire: WireBundle =
            serde_json::from_value(value).map_err(|e| BundleError::Parse(e.to_string()))?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireBundle) -> Result<Self> {
        Ok(Self {
            start: Some(Start::from_wire(wire.start)?),
            commands: wire.commands,
            margin_ms: DEFAULT_BUNDLE_MARGIN_MS,
            methods: Arc::new(BTreeSet::new()),
            frozen: true,
        })
    }

    /// Copy a frozen bundle into a new mutable one.
    ///
    /// The copy keeps the commands, margin, allow-list and start time, so its
    /// serialized form equals the original's until it is modified.
    pub fn try_clone(&self) -> Result<Self> {
        if !self.frozen {
            return Err(BundleError::NotFrozen);
        }
        Ok(Self {
            frozen: false,
            ..self.clone()
        })
    }

    /// Content hash of the serialized form.
    pub fn id(&self) -> Result<BundleId> {
        let bytes = self.serialize()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(BundleId(format!("{:x}", hasher.finalize())))
    }

    /// Start time, if fixed.
    pub fn start(&self) -> Option<Start> {
        self.start
    }

    /// Commands in execution order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Margin added by `StartHint::At` and `StartHint::Current`.
    pub fn margin_ms(&self) -> u64 {
        self.margin_ms
    }

    /// True once frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}
