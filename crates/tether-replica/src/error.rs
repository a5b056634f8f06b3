// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for replica maps and channels.

use thiserror::Error;

/// Result type using ReplicaError
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors raised by [`SharedMap`](crate::SharedMap), [`MapRef`](crate::MapRef)
/// and the [`channel`](crate::channel) helpers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplicaError {
    /// Mutation attempted through a read-only reference.
    #[error("map reference is read-only")]
    ReadOnly,

    /// Mutation attempted after `prepare()` froze the reference.
    #[error("map reference already prepared, changes are frozen")]
    Frozen,

    /// Commit attempted with a reference that was never prepared.
    #[error("map reference must be prepared before commit")]
    NotPrepared,

    /// The reference or diff was taken against a different version.
    #[error("version mismatch: expected base version {expected}, found {found}")]
    VersionMismatch {
        /// Version of the map the changes are applied to.
        expected: u64,
        /// Base version carried by the changes.
        found: u64,
    },

    /// A stored value does not have the expected shape.
    #[error("malformed entry '{key}': {reason}")]
    Malformed {
        /// The offending key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl ReplicaError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ReadOnly => "REPLICA_READ_ONLY",
            Self::Frozen => "REPLICA_FROZEN",
            Self::NotPrepared => "REPLICA_NOT_PREPARED",
            Self::VersionMismatch { .. } => "REPLICA_VERSION_MISMATCH",
            Self::Malformed { .. } => "REPLICA_MALFORMED",
        }
    }

    pub(crate) fn malformed(key: &str, reason: impl ToString) -> Self {
        Self::Malformed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}
