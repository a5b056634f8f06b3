// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Core - Device Runtime Kernel
//!
//! This crate runs on the device side of a device/cloud pair. It executes
//! time-stamped command bundles sent by a cloud actor, keeps two replicated
//! maps in sync with that actor, and funnels all work through a single
//! transactional queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Cloud actor                             │
//! │        (bundles on fromCloudChannel, acks on reply channel)      │
//! └──────────────────────────────────────────────────────────────────┘
//!           ▲ toCloud diff            │ fromCloud snapshot, notifications
//!           │                         ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SyncEngine  ◄── QueueWorker ◄── QueueHandle ◄─┬─ BundleScheduler│
//! │  (replicas,       (one tx at      (enqueue)    ├─ CronTable      │
//! │   app state)       a time)                     └─ notifications  │
//! │                        ▲                                         │
//! │                        └──── Watchdog (progress check)           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Transactions
//!
//! | Step | Effect |
//! |------|--------|
//! | `begin` | surface a failed upload, apply incoming changes, snapshot state |
//! | `execute` | `__pulse__`, `__setup__` or a registered method |
//! | `prepare` | prune acknowledged channel messages, freeze the diff |
//! | `commit` | merge the diff, hand it to the uploader |
//! | `abort` | restore the state snapshot, drop the diff |
//!
//! # Bundles
//!
//! A [`Bundle`](bundle::Bundle) is an ordered list of commands, each delayed
//! relative to the previous one, plus a start time. The scheduler keeps at
//! most one bundle active: activating a new one cancels whatever remains of
//! the previous one.
//!
//! # Configuration
//!
//! See [`config::KernelConfig::from_env`] for the `TETHER_*` variables.

#![deny(missing_docs)]

/// Command bundles and their wire format.
pub mod bundle;
/// Wall clock and cloud-offset correction.
pub mod clock;
/// Cloud session contract and implementations.
pub mod cloud;
/// Kernel configuration.
pub mod config;
/// Named repeating timers.
pub mod cron;
/// Error types.
pub mod error;
/// Application handler contract.
pub mod handler;
/// Halt-and-restart requests for the host supervisor.
pub mod nap;
/// Serializing transactional queue.
pub mod queue;
/// Runtime assembly.
pub mod runtime;
/// Bundle scheduler.
pub mod scheduler;
/// Shutdown coordination.
pub mod shutdown;
/// Transactional synchronization engine.
pub mod sync;
/// Liveness watchdog.
pub mod watchdog;

pub use bundle::{Bundle, BundleId, StartHint};
pub use cloud::{CloudSession, LoopbackCloud};
pub use config::KernelConfig;
pub use error::{KernelError, Result, TransactionFault};
pub use handler::{Application, ErrorDisposition, MethodTable, TxContext};
pub use runtime::{DeviceRuntime, RunMode};
pub use shutdown::ShutdownReason;
