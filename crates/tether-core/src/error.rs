// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tether-core.
//!
//! Each concern has its own error enum. All of them expose a stable
//! `error_code()` so faults can be reported to the cloud actor or matched in
//! logs without depending on display strings.

use tether_replica::ReplicaError;
use thiserror::Error;

/// Result type using KernelError
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors raised while building, freezing or parsing a [`Bundle`](crate::bundle::Bundle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BundleError {
    /// `append` called on a frozen bundle.
    #[error("bundle is frozen, commands cannot be appended")]
    Frozen,

    /// `freeze` called twice.
    #[error("bundle is already frozen")]
    AlreadyFrozen,

    /// `try_clone` called on a bundle that was never frozen.
    #[error("only frozen bundles can be cloned")]
    NotFrozen,

    /// Serialization attempted before a start time was fixed.
    #[error("bundle start time is not set")]
    StartUnset,

    /// The method is not in the bundle's allow-list.
    #[error("method '{0}' is not known to the device")]
    UnknownMethod(String),

    /// The wire form could not be decoded.
    #[error("invalid bundle: {0}")]
    Parse(String),
}

impl BundleError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Frozen => "BUNDLE_FROZEN",
            Self::AlreadyFrozen => "BUNDLE_ALREADY_FROZEN",
            Self::NotFrozen => "BUNDLE_NOT_FROZEN",
            Self::StartUnset => "BUNDLE_START_UNSET",
            Self::UnknownMethod(_) => "BUNDLE_UNKNOWN_METHOD",
            Self::Parse(_) => "BUNDLE_PARSE_ERROR",
        }
    }
}

/// Errors reported by a [`CloudSession`](crate::cloud::CloudSession).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CloudError {
    /// The request never completed (network, timeout, injected failure).
    #[error("cloud transport failed: {0}")]
    Transport(String),

    /// The cloud actor answered but refused the request.
    #[error("cloud rejected request: {0}")]
    Rejected(String),

    /// The reply could not be decoded.
    #[error("invalid cloud response: {0}")]
    Protocol(String),

    /// The session was closed.
    #[error("cloud session closed")]
    Closed,
}

impl CloudError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "CLOUD_TRANSPORT",
            Self::Rejected(_) => "CLOUD_REJECTED",
            Self::Protocol(_) => "CLOUD_PROTOCOL",
            Self::Closed => "CLOUD_CLOSED",
        }
    }
}

/// Failure of one queued transaction.
///
/// Handed to [`Application::on_error`](crate::handler::Application::on_error)
/// and returned to whoever awaited the enqueue.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum TransactionFault {
    /// The previous upload failed. Surfaced at `begin` of the next transaction.
    #[error("deferred sync failure: {0}")]
    Sync(CloudError),

    /// A business method or lifecycle hook returned an error.
    #[error("method '{method}' failed: {message}")]
    Handler {
        /// Method that failed.
        method: String,
        /// Error rendered by the handler.
        message: String,
    },

    /// No method with this name is registered.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// Prepare step failed.
    #[error("prepare failed: {0}")]
    Prepare(String),

    /// Commit step failed. The outbound replica was left untouched.
    #[error("commit failed: {0}")]
    Commit(String),

    /// A panic was caught inside the transaction.
    #[error("transaction panicked: {0}")]
    Panicked(String),

    /// A lifecycle step ran without an open transaction.
    #[error("no open transaction")]
    NoTransaction,

    /// Incoming changes could not be applied to a replica.
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

impl TransactionFault {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Sync(_) => "SYNC_FAILURE",
            Self::Handler { .. } => "HANDLER_ERROR",
            Self::UnknownMethod(_) => "UNKNOWN_METHOD",
            Self::Prepare(_) => "PREPARE_FAILURE",
            Self::Commit(_) => "COMMIT_FAILURE",
            Self::Panicked(_) => "EXCEPTION_THROWN",
            Self::NoTransaction => "NO_TRANSACTION",
            Self::Replica(e) => e.error_code(),
        }
    }
}

/// Errors returned when submitting work to the message queue.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum QueueError {
    /// The queue is shutting down and refuses new work.
    #[error("message queue is shutting down")]
    ShuttingDown,

    /// The worker stopped before the message was processed.
    #[error("message queue closed before the message was processed")]
    Closed,

    /// The transaction ran and failed.
    #[error(transparent)]
    Transaction(#[from] TransactionFault),
}

impl QueueError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ShuttingDown => "QUEUE_SHUTTING_DOWN",
            Self::Closed => "QUEUE_CLOSED",
            Self::Transaction(fault) => fault.error_code(),
        }
    }
}

/// Errors from assembling and running a [`DeviceRuntime`](crate::runtime::DeviceRuntime).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// `start()` called on a runtime built in introspection mode.
    #[error("runtime was built in introspection mode and cannot start")]
    IntrospectOnly,

    /// The builder was missing a required component.
    #[error("missing required component: {0}")]
    MissingComponent(&'static str),

    /// Talking to the cloud actor failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// A startup transaction failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A stop hook failed while shutting down.
    #[error("shutdown hook '{hook}' failed: {reason}")]
    ShutdownFailed {
        /// Name of the failing hook.
        hook: &'static str,
        /// Rendered error.
        reason: String,
    },
}

impl KernelError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::IntrospectOnly => "INTROSPECT_ONLY",
            Self::MissingComponent(_) => "MISSING_COMPONENT",
            Self::Cloud(e) => e.error_code(),
            Self::Queue(e) => e.error_code(),
            Self::ShutdownFailed { .. } => "SHUTDOWN_FAILED",
        }
    }
}
