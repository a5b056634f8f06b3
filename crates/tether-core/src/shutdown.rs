// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered runtime shutdown.
//!
//! The runtime composes its stop hooks once, at construction, in the order
//! they must run (cron, then scheduler, then queue). Triggering runs them,
//! cancels the shared [`CancellationToken`] and publishes the reason.
//! If a hook fails the runtime cannot be trusted to be quiescent, and
//! [`ShutdownController::trigger_or_exit`] terminates the process so an
//! external supervisor can restart it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::KernelError;

/// Why the runtime stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Explicit request through [`DeviceRuntime::shutdown`](crate::runtime::DeviceRuntime::shutdown).
    Requested,
    /// The liveness watchdog found the queue stuck.
    Liveness,
    /// A transaction fault escalated past the application's error hook.
    Fault {
        /// Stable code of the fault.
        code: &'static str,
        /// Rendered fault.
        message: String,
    },
    /// The cloud session was closed by the other side.
    CloudClosed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Liveness => write!(f, "liveness failure"),
            Self::Fault { code, message } => write!(f, "fault {}: {}", code, message),
            Self::CloudClosed => write!(f, "cloud session closed"),
        }
    }
}

type StopHook = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Builder for a [`ShutdownController`].
pub struct ShutdownControllerBuilder {
    hooks: Vec<(&'static str, StopHook)>,
    exit: ExitHook,
}

impl fmt::Debug for ShutdownControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownControllerBuilder")
            .field(
                "hooks",
                &self.hooks.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for ShutdownControllerBuilder {
    fn default() -> Self {
        Self {
            hooks: Vec::new(),
            exit: Arc::new(|code| std::process::exit(code)),
        }
    }
}

impl ShutdownControllerBuilder {
    /// Append a stop hook. Hooks run in the order they were added.
    pub fn hook<F>(mut self, name: &'static str, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.push((name, Box::new(hook)));
        self
    }

    /// Replace the process exit used when shutdown fails.
    pub fn exit_hook<F>(mut self, exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Arc::new(exit);
        self
    }

    /// Build the controller.
    pub fn build(self) -> ShutdownController {
        let (reason_tx, _) = watch::channel(None);
        ShutdownController {
            inner: Arc::new(Inner {
                hooks: self.hooks,
                exit: self.exit,
                token: CancellationToken::new(),
                reason_tx,
                triggered: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    hooks: Vec<(&'static str, StopHook)>,
    exit: ExitHook,
    token: CancellationToken,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
    triggered: AtomicBool,
}

/// Shared handle that stops the runtime exactly once.
#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownController")
            .field("triggered", &self.is_triggered())
            .field("hooks", &self.inner.hooks.len())
            .finish()
    }
}

impl ShutdownController {
    /// Create a new builder.
    pub fn builder() -> ShutdownControllerBuilder {
        ShutdownControllerBuilder::default()
    }

    /// Token cancelled when shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// True once shutdown was triggered.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// The reason, once triggered.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.reason_tx.borrow().clone()
    }

    /// Run every stop hook and cancel the token.
    ///
    /// Returns `Ok(false)` if shutdown was already triggered. All hooks run
    /// even if an earlier one fails; the first failure is returned.
    pub fn trigger(&self, reason: ShutdownReason) -> Result<bool, KernelError> {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        info!(reason = %reason, "Shutting down device runtime");

        let mut first_failure = None;
        for (name, hook) in &self.inner.hooks {
            let name: &'static str = name;
            if let Err(e) = hook() {
                error!(hook = name, error = %e, "Stop hook failed");
                first_failure.get_or_insert(KernelError::ShutdownFailed {
                    hook: name,
                    reason: e.to_string(),
                });
            }
        }

        self.inner.token.cancel();
        self.inner.reason_tx.send_replace(Some(reason));

        match first_failure {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Trigger shutdown and terminate the process if it fails.
    pub fn trigger_or_exit(&self, reason: ShutdownReason) {
        if let Err(e) = self.trigger(reason) {
            error!(error = %e, "Critical shutdown failed, exiting");
            (self.inner.exit)(1);
        }
    }

    /// Wait until shutdown is triggered and return the reason.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.inner.reason_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `inner`, which we hold.
                return ShutdownReason::Requested;
            }
        }
    }
}
