// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named repeating timers that enqueue methods on the message queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::queue::{EnqueueOptions, QueueHandle};

/// Name of the timer driving the pulse transaction.
pub const PULSE_CRON_NAME: &str = "pulseCron";

/// Arguments passed on every firing.
#[derive(Clone)]
pub enum CronArgs {
    /// Same arguments every time.
    Fixed(Vec<Value>),
    /// Produced just before each firing.
    Dynamic(Arc<dyn Fn() -> Vec<Value> + Send + Sync>),
}

impl CronArgs {
    /// Convenience for a dynamic producer.
    pub fn dynamic<F>(producer: F) -> Self
    where
        F: Fn() -> Vec<Value> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(producer))
    }

    fn produce(&self) -> Vec<Value> {
        match self {
            Self::Fixed(args) => args.clone(),
            Self::Dynamic(producer) => producer(),
        }
    }
}

impl fmt::Debug for CronArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(args) => f.debug_tuple("Fixed").field(args).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Description of one repeating timer.
#[derive(Debug, Clone)]
pub struct CronJob {
    /// Method enqueued on each firing.
    pub method: String,
    /// Arguments for each firing.
    pub args: CronArgs,
    /// Time between firings. The first firing happens one interval after `add`.
    pub interval: Duration,
    /// Options for each enqueued message.
    pub options: EnqueueOptions,
}

impl CronJob {
    /// A job with fixed arguments and default options.
    pub fn new(method: impl Into<String>, args: Vec<Value>, interval: Duration) -> Self {
        Self {
            method: method.into(),
            args: CronArgs::Fixed(args),
            interval,
            options: EnqueueOptions::default(),
        }
    }

    /// Replace the arguments.
    pub fn with_args(mut self, args: CronArgs) -> Self {
        self.args = args;
        self
    }

    /// Replace the enqueue options.
    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }
}

/// Cloneable table of named timers.
#[derive(Clone)]
pub struct CronTable {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    queue: QueueHandle,
}

impl fmt::Debug for CronTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronTable")
            .field("names", &self.names())
            .finish()
    }
}

impl CronTable {
    /// Create an empty table enqueueing on `queue`.
    pub fn new(queue: QueueHandle) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            queue,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a timer, replacing any timer with the same name.
    pub fn add(&self, name: impl Into<String>, job: CronJob) {
        let name = name.into();
        let interval = job.interval.max(Duration::from_millis(1));
        let queue = self.queue.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let args = job.args.produce();
                if let Err(e) = queue.enqueue_detached(job.method.clone(), args, job.options) {
                    trace!(cron = %task_name, error = %e, "Error in cron");
                }
            }
        });

        debug!(cron = %name, interval_ms = interval.as_millis() as u64, "Cron added");
        if let Some(previous) = self.lock().insert(name, handle) {
            previous.abort();
        }
    }

    /// Stop and remove a timer. Returns false if no timer had that name.
    pub fn delete(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                debug!(cron = name, "Cron deleted");
                true
            }
            None => false,
        }
    }

    /// Stop every timer.
    pub fn stop(&self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }

    /// Names of running timers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_first_firing_after_one_interval() {
        let (queue, mut worker) = queue::channel();
        let cron = CronTable::new(queue);
        cron.add(
            "tick",
            CronJob::new("beep", vec![json!(1)], Duration::from_millis(100)),
        );

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(worker.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(202)).await;
        let fired = worker.drain();
        assert_eq!(fired.len(), 3);
        assert!(fired.iter().all(|m| m.method == "beep" && m.args == vec![json!(1)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_args_and_options() {
        let (queue, mut worker) = queue::channel();
        let cron = CronTable::new(queue);
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        cron.add(
            "count",
            CronJob::new("report", vec![], Duration::from_millis(10))
                .with_args(CronArgs::dynamic(move || {
                    vec![json!(c.fetch_add(1, Ordering::SeqCst))]
                }))
                .with_options(EnqueueOptions::skip_sync()),
        );

        tokio::time::sleep(Duration::from_millis(25)).await;
        let fired = worker.drain();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].args, vec![json!(0)]);
        assert_eq!(fired[1].args, vec![json!(1)]);
        assert!(fired[0].options.skip_sync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_replaces_and_delete_stops() {
        let (queue, mut worker) = queue::channel();
        let cron = CronTable::new(queue);
        cron.add("job", CronJob::new("old", vec![], Duration::from_millis(10)));
        cron.add("job", CronJob::new("new", vec![], Duration::from_millis(10)));
        assert_eq!(cron.names(), vec!["job".to_string()]);

        tokio::time::sleep(Duration::from_millis(15)).await;
        let fired: Vec<String> = worker.drain().into_iter().map(|m| m.method).collect();
        assert_eq!(fired, vec!["new"]);

        assert!(cron.delete("job"));
        assert!(!cron.delete("job"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_all() {
        let (queue, mut worker) = queue::channel();
        let cron = CronTable::new(queue);
        cron.add("a", CronJob::new("a", vec![], Duration::from_millis(10)));
        cron.add("b", CronJob::new("b", vec![], Duration::from_millis(10)));

        cron.stop();
        assert!(cron.names().is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.drain().is_empty());
    }
}
