// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application handler contract.
//!
//! An application plugs into the runtime in two ways:
//!
//! - an [`Application`] with the lifecycle hooks (`setup`, `pulse`, `on_error`);
//! - a [`MethodTable`] of named business methods that bundles, cron timers
//!   and direct enqueues dispatch to.
//!
//! Both receive a [`TxContext`] scoped to the running transaction.
//!
//! # Example
//!
//! ```
//! use serde_json::{Value, json};
//! use tether_core::handler::MethodTable;
//!
//! let mut methods = MethodTable::new();
//! methods.register_fn("down", |ctx, args| {
//!     ctx.to_cloud.set("position", json!("down"))?;
//!     Ok(args.first().cloned().unwrap_or(Value::Null))
//! });
//! assert!(methods.contains("down"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tether_replica::MapRef;
use tracing::warn;

use crate::clock::CorrectedClock;
use crate::cron::CronTable;
use crate::error::TransactionFault;
use crate::nap::NapMailbox;
use crate::queue::QueueHandle;
use crate::scheduler::BundleScheduler;

/// Method dispatched once per pulse.
pub const PULSE_METHOD: &str = "__pulse__";
/// Method dispatched once per runtime start.
pub const SETUP_METHOD: &str = "__setup__";

/// What the queue does with a failed transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Abort the transaction and keep going.
    Absorb,
    /// Shut the runtime down.
    #[default]
    Propagate,
}

/// Everything a handler may touch during one transaction.
pub struct TxContext<'a> {
    /// Application state. Restored on abort.
    pub state: &'a mut Value,
    /// Scratch space. Survives aborts.
    pub scratch: &'a mut Map<String, Value>,
    /// Device → cloud replica, writable.
    pub to_cloud: &'a mut MapRef,
    /// Cloud → device replica, read-only.
    pub from_cloud: &'a MapRef,
    pub(crate) scheduler: &'a BundleScheduler,
    pub(crate) cron: &'a CronTable,
    pub(crate) clock: &'a CorrectedClock,
    pub(crate) queue: &'a QueueHandle,
    pub(crate) nap: Option<&'a NapMailbox>,
}

impl fmt::Debug for TxContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("state", &self.state)
            .field("to_cloud_version", &self.to_cloud.base_version())
            .field("from_cloud_version", &self.from_cloud.base_version())
            .finish()
    }
}

impl TxContext<'_> {
    /// The bundle scheduler.
    pub fn scheduler(&self) -> &BundleScheduler {
        self.scheduler
    }

    /// Named repeating timers.
    pub fn cron(&self) -> &CronTable {
        self.cron
    }

    /// The message queue, for scheduling follow-up work.
    pub fn queue(&self) -> &QueueHandle {
        self.queue
    }

    /// Cloud-corrected time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Ask the host supervisor to halt the board and restart it after `after`.
    ///
    /// Returns false if no mailbox is configured or the request could not be
    /// written.
    pub fn halt_and_restart(&self, after: Duration) -> bool {
        match self.nap {
            Some(mailbox) => mailbox.halt_and_restart(after, self.clock.now_ms()),
            None => {
                warn!("Cannot haltAndRestart: no nap mailbox configured");
                false
            }
        }
    }
}

/// Lifecycle hooks of a device application.
///
/// Every hook has a default, so a unit struct is a valid application.
#[async_trait]
pub trait Application: Send + Sync {
    /// Called once per runtime start, after resuming from the cloud.
    async fn setup(&self, _ctx: &mut TxContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on every pulse, after new bundles were handed to the scheduler.
    async fn pulse(&self, _ctx: &mut TxContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Decide what happens to a failed transaction.
    fn on_error(&self, _fault: &TransactionFault) -> ErrorDisposition {
        ErrorDisposition::Propagate
    }
}

/// Application with no behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopApplication;

impl Application for NoopApplication {}

/// A named business method.
#[async_trait]
pub trait Method: Send + Sync {
    /// Run with positional arguments.
    async fn call(&self, ctx: &mut TxContext<'_>, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct FnMethod<F>(F);

#[async_trait]
impl<F> Method for FnMethod<F>
where
    F: Fn(&mut TxContext<'_>, Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn call(&self, ctx: &mut TxContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(ctx, args)
    }
}

/// Name → method lookup table.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, Arc<dyn Method>>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

impl MethodTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, method: Arc<dyn Method>) -> &mut Self {
        let name = name.into();
        if name == PULSE_METHOD || name == SETUP_METHOD {
            warn!(method = %name, "Reserved method name is shadowed by the runtime");
        }
        self.methods.insert(name, method);
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut TxContext<'_>, Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnMethod(f)))
    }

    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}
