// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Device runtime assembly.
//!
//! [`DeviceRuntime`] wires the kernel together: clock, message queue, bundle
//! scheduler, cron table, sync engine, liveness watchdog and the cloud
//! notification listener.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_core::cloud::LoopbackCloud;
//! use tether_core::config::KernelConfig;
//! use tether_core::runtime::DeviceRuntime;
//!
//! # async fn run() -> Result<(), tether_core::error::KernelError> {
//! let runtime = DeviceRuntime::builder()
//!     .config(KernelConfig::default())
//!     .cloud(Arc::new(LoopbackCloud::new()))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... run until something stops it ...
//! let reason = runtime.wait().await;
//! println!("stopped: {reason}");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, CorrectedClock, SystemClock};
use crate::cloud::{CloudSession, Notification};
use crate::config::KernelConfig;
use crate::cron::{CronJob, CronTable, PULSE_CRON_NAME};
use crate::error::{KernelError, Result};
use crate::handler::{Application, MethodTable, NoopApplication, PULSE_METHOD, SETUP_METHOD};
use crate::queue::{self, EnqueueOptions, QueueHandle};
use crate::scheduler::BundleScheduler;
use crate::shutdown::{ShutdownController, ShutdownReason};
use crate::sync::{AckHistory, EngineParts, SyncEngine};
use crate::watchdog::Watchdog;

/// How long [`DeviceRuntime::shutdown`] waits for each background task.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Whether the runtime may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Normal operation.
    #[default]
    Run,
    /// Assemble and describe only; `start()` fails.
    IntrospectOnly,
}

/// Builder for creating a [`DeviceRuntime`].
pub struct DeviceRuntimeBuilder {
    config: KernelConfig,
    cloud: Option<Arc<dyn CloudSession>>,
    application: Arc<dyn Application>,
    methods: MethodTable,
    clock: Arc<dyn Clock>,
    mode: RunMode,
    exit_hook: Option<ExitHook>,
}

impl std::fmt::Debug for DeviceRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRuntimeBuilder")
            .field("config", &self.config)
            .field("cloud", &self.cloud.as_ref().map(|_| "..."))
            .field("methods", &self.methods)
            .field("clock", &self.clock)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Default for DeviceRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: KernelConfig::default(),
            cloud: None,
            application: Arc::new(NoopApplication),
            methods: MethodTable::new(),
            clock: Arc::new(SystemClock),
            mode: RunMode::Run,
            exit_hook: None,
        }
    }
}

impl DeviceRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel tunables.
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cloud session (required to start).
    pub fn cloud(mut self, cloud: Arc<dyn CloudSession>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Set the application lifecycle hooks.
    ///
    /// Default: [`NoopApplication`]
    pub fn application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = application;
        self
    }

    /// Set the business methods.
    pub fn methods(mut self, methods: MethodTable) -> Self {
        self.methods = methods;
        self
    }

    /// Replace the wall clock. Useful for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Select the run mode.
    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the process exit used when shutdown itself fails.
    ///
    /// Default: `std::process::exit`
    pub fn exit_hook<F>(mut self, exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit_hook = Some(Arc::new(exit));
        self
    }

    /// Build the runtime configuration.
    ///
    /// A cloud session is required unless the mode is
    /// [`RunMode::IntrospectOnly`].
    pub fn build(self) -> Result<DeviceRuntimeConfig> {
        if self.mode == RunMode::Run && self.cloud.is_none() {
            return Err(KernelError::MissingComponent("cloud"));
        }
        Ok(DeviceRuntimeConfig {
            config: self.config,
            cloud: self.cloud,
            application: self.application,
            methods: self.methods,
            clock: self.clock,
            mode: self.mode,
            exit_hook: self.exit_hook,
        })
    }
}

/// Validated configuration for a [`DeviceRuntime`].
pub struct DeviceRuntimeConfig {
    config: KernelConfig,
    cloud: Option<Arc<dyn CloudSession>>,
    application: Arc<dyn Application>,
    methods: MethodTable,
    clock: Arc<dyn Clock>,
    mode: RunMode,
    exit_hook: Option<ExitHook>,
}

impl std::fmt::Debug for DeviceRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRuntimeConfig")
            .field("config", &self.config)
            .field("methods", &self.methods)
            .field("mode", &self.mode)
            .finish()
    }
}

impl DeviceRuntimeConfig {
    /// The selected run mode.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Kernel tunables.
    pub fn kernel_config(&self) -> &KernelConfig {
        &self.config
    }

    /// Names of the registered business methods, sorted.
    pub fn describe(&self) -> Vec<String> {
        self.methods.names()
    }

    fn shutdown_controller(
        &self,
        cron: &CronTable,
        scheduler: &BundleScheduler,
        queue: &QueueHandle,
    ) -> ShutdownController {
        let (cron, scheduler, queue) = (cron.clone(), scheduler.clone(), queue.clone());
        let mut builder = ShutdownController::builder()
            .hook("cron", move || {
                cron.stop();
                Ok(())
            })
            .hook("scheduler", move || {
                scheduler.stop();
                Ok(())
            })
            .hook("queue", move || {
                queue.close();
                Ok(())
            });
        if let Some(exit) = self.exit_hook.clone() {
            builder = builder.exit_hook(move |code| exit(code));
        }
        builder.build()
    }

    /// Resume from the cloud, run `__setup__` and the first pulse, then start
    /// the background tasks.
    #[instrument(skip_all, fields(mode = ?self.mode))]
    pub async fn start(self) -> Result<DeviceRuntime> {
        if self.mode == RunMode::IntrospectOnly {
            return Err(KernelError::IntrospectOnly);
        }
        let Some(cloud) = self.cloud.clone() else {
            return Err(KernelError::MissingComponent("cloud"));
        };

        let clock = Arc::new(CorrectedClock::new(
            self.clock.clone(),
            self.config.clock_offset_threshold_ms,
        ));
        let (queue, worker) = queue::channel();
        let scheduler = BundleScheduler::new(clock.clone(), queue.clone());
        let cron = CronTable::new(queue.clone());
        let shutdown = self.shutdown_controller(&cron, &scheduler, &queue);

        let mut engine = SyncEngine::new(
            EngineParts {
                cloud: cloud.clone(),
                application: self.application,
                methods: self.methods,
                scheduler: scheduler.clone(),
                cron: cron.clone(),
                clock: clock.clone(),
                queue: queue.clone(),
                ack_history_size: self.config.ack_history_size,
                nap: self.config.nap_mailbox(),
            },
            shutdown.token(),
        );
        engine.resume().await?;
        let acks = engine.acks();
        let notifications = cloud.subscribe();

        let mut tasks = vec![tokio::spawn(worker.run(engine, shutdown.clone()))];

        for method in [SETUP_METHOD, PULSE_METHOD] {
            if let Err(e) = queue
                .enqueue(method, Vec::new(), EnqueueOptions::default())
                .await
            {
                error!(method, code = e.error_code(), error = %e, "Startup transaction failed");
                let reason = ShutdownReason::Fault {
                    code: e.error_code(),
                    message: e.to_string(),
                };
                if let Err(hook_err) = shutdown.trigger(reason) {
                    error!(error = %hook_err, "Shutdown after failed startup was incomplete");
                }
                join_all(tasks).await;
                return Err(e.into());
            }
        }

        cron.add(
            PULSE_CRON_NAME,
            CronJob::new(PULSE_METHOD, Vec::new(), self.config.pulse_interval),
        );

        let watchdog = Watchdog::new(
            queue.clone(),
            shutdown.clone(),
            self.config.watchdog_interval,
        );
        tasks.push(tokio::spawn(watchdog.run()));
        tasks.push(tokio::spawn(listen(
            notifications,
            queue.clone(),
            shutdown.clone(),
        )));

        info!(
            pulse_interval_ms = self.config.pulse_interval.as_millis() as u64,
            watchdog_interval_ms = self.config.watchdog_interval.as_millis() as u64,
            "Device runtime started"
        );

        Ok(DeviceRuntime {
            queue,
            scheduler,
            cron,
            clock,
            acks,
            cloud,
            shutdown,
            tasks,
        })
    }
}

/// A running device kernel.
///
/// The runtime manages:
/// - the queue worker driving the sync engine
/// - the pulse timer and any application timers
/// - the liveness watchdog
/// - the cloud notification listener
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct DeviceRuntime {
    queue: QueueHandle,
    scheduler: BundleScheduler,
    cron: CronTable,
    clock: Arc<CorrectedClock>,
    acks: AckHistory,
    cloud: Arc<dyn CloudSession>,
    shutdown: ShutdownController,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("queue", &self.queue)
            .field("scheduler", &self.scheduler)
            .field("cron", &self.cron)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl DeviceRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> DeviceRuntimeBuilder {
        DeviceRuntimeBuilder::new()
    }

    /// Handle for submitting work.
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// The bundle scheduler.
    pub fn scheduler(&self) -> &BundleScheduler {
        &self.scheduler
    }

    /// Named repeating timers.
    pub fn cron(&self) -> &CronTable {
        &self.cron
    }

    /// Cloud-corrected clock.
    pub fn clock(&self) -> &CorrectedClock {
        &self.clock
    }

    /// Most recent bundle acknowledgements, oldest first.
    pub fn acks(&self) -> Vec<crate::cloud::BundleAck> {
        self.acks.snapshot()
    }

    /// True until shutdown is triggered.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
    }

    /// Wait until the runtime stops, for any reason.
    pub async fn wait(&self) -> ShutdownReason {
        self.shutdown.wait().await
    }

    /// Stop everything and wait for the background tasks.
    ///
    /// Returns the reason the runtime stopped, which is
    /// [`ShutdownReason::Requested`] unless something else stopped it first.
    pub async fn shutdown(self) -> Result<ShutdownReason> {
        info!("Device runtime shutting down...");
        let triggered = self.shutdown.trigger(ShutdownReason::Requested);

        if let Err(e) = self.cloud.close().await {
            warn!(error = %e, "Failed to close cloud session");
        }
        join_all(self.tasks).await;
        triggered?;

        let reason = self
            .shutdown
            .reason()
            .unwrap_or(ShutdownReason::Requested);
        info!(reason = %reason, "Device runtime shutdown complete");
        Ok(reason)
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let abort = task.abort_handle();
        match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(error = %e, "Background task panicked"),
            Err(_) => {
                warn!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Forward cloud notifications into the queue until shutdown.
async fn listen(
    mut notifications: broadcast::Receiver<Notification>,
    queue: QueueHandle,
    shutdown: ShutdownController,
) {
    let token = shutdown.token();

    loop {
        let next = tokio::select! {
            biased;

            _ = token.cancelled() => break,

            next = notifications.recv() => next,
        };

        match next {
            Ok(Notification::Message(payload)) => {
                debug!(%payload, "Cloud notification");
                enqueue_full_cycle(&queue);
            }
            Ok(Notification::Closed) => {
                warn!("Cloud session closed, shutting down");
                shutdown.trigger_or_exit(ShutdownReason::CloudClosed);
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed cloud notifications");
                enqueue_full_cycle(&queue);
            }
            Err(RecvError::Closed) => {
                debug!("Cloud notification stream ended");
                break;
            }
        }
    }
}

fn enqueue_full_cycle(queue: &QueueHandle) {
    if let Err(e) = queue.enqueue_detached(PULSE_METHOD, Vec::new(), EnqueueOptions::full_cycle()) {
        debug!(error = %e, "Could not enqueue pulse for notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::LoopbackCloud;
    use serde_json::Value;

    fn methods() -> MethodTable {
        let mut methods = MethodTable::new();
        methods
            .register_fn("down", |_ctx, _args| Ok(Value::Null))
            .register_fn("up", |_ctx, _args| Ok(Value::Null));
        methods
    }

    #[test]
    fn test_build_requires_cloud() {
        let err = DeviceRuntime::builder().build().unwrap_err();
        assert!(matches!(err, KernelError::MissingComponent("cloud")));
        assert_eq!(err.error_code(), "MISSING_COMPONENT");
    }

    #[test]
    fn test_builder_debug_hides_cloud() {
        let builder = DeviceRuntime::builder().cloud(Arc::new(LoopbackCloud::new()));
        let debug = format!("{:?}", builder);
        assert!(debug.contains("DeviceRuntimeBuilder"));
        assert!(debug.contains("..."));
    }

    #[tokio::test]
    async fn test_introspect_only_describes_but_never_starts() {
        let config = DeviceRuntime::builder()
            .methods(methods())
            .mode(RunMode::IntrospectOnly)
            .build()
            .unwrap();
        assert_eq!(config.mode(), RunMode::IntrospectOnly);
        assert_eq!(config.describe(), vec!["down".to_string(), "up".to_string()]);

        let err = config.start().await.unwrap_err();
        assert!(matches!(err, KernelError::IntrospectOnly));
    }

    #[tokio::test]
    async fn test_start_fails_when_cloud_is_closed() {
        let cloud = LoopbackCloud::new();
        cloud.close().await.unwrap();
        let err = DeviceRuntime::builder()
            .cloud(Arc::new(cloud))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CLOUD_CLOSED");
    }
}
