// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serializing message queue.
//!
//! Every unit of work (pulse, bundle command, cron firing, cloud notification)
//! becomes a [`Message`] that a single worker task runs as one transaction:
//!
//! ```text
//! begin ──► execute ──► prepare ──► commit ──► reply Ok
//!   │          │           │          │
//!   └──────────┴─────┬─────┴──────────┘
//!                    ▼
//!          Transactional::on_error
//!           │                  │
//!        Absorb            Propagate
//!           │                  │
//!         abort ──(fails)──► shutdown ──(fails)──► exit(1)
//! ```
//!
//! The transaction runs inside `catch_unwind`, so a panicking handler becomes
//! [`TransactionFault::Panicked`] instead of taking the worker down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{QueueError, TransactionFault};
use crate::handler::ErrorDisposition;
use crate::shutdown::{ShutdownController, ShutdownReason};

/// Per-message flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Commit locally but do not upload the diff.
    pub skip_sync: bool,
    /// Enqueue another pulse as soon as the upload completes.
    pub full_cycle: bool,
}

impl EnqueueOptions {
    /// Options for a skip-sync message.
    pub fn skip_sync() -> Self {
        Self {
            skip_sync: true,
            ..Self::default()
        }
    }

    /// Options for a full-cycle message.
    pub fn full_cycle() -> Self {
        Self {
            full_cycle: true,
            ..Self::default()
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Method to dispatch.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Per-message flags.
    pub options: EnqueueOptions,
}

impl Message {
    /// Create a message.
    pub fn new(method: impl Into<String>, args: Vec<Value>, options: EnqueueOptions) -> Self {
        Self {
            method: method.into(),
            args,
            options,
        }
    }
}

/// The transactional target the worker drives.
///
/// Implemented by [`SyncEngine`](crate::sync::SyncEngine).
#[async_trait]
pub trait Transactional: Send {
    /// Open a transaction for `message`.
    async fn begin(&mut self, message: &Message) -> Result<(), TransactionFault>;

    /// Run the message's method.
    async fn execute(&mut self, message: &Message) -> Result<Value, TransactionFault>;

    /// Freeze the transaction's changes.
    async fn prepare(&mut self) -> Result<(), TransactionFault>;

    /// Make the transaction's changes durable.
    async fn commit(&mut self) -> Result<(), TransactionFault>;

    /// Roll back the open transaction, if any.
    async fn abort(&mut self) -> Result<(), TransactionFault>;

    /// Decide whether a fault is absorbed or escalated to shutdown.
    fn on_error(&self, fault: &TransactionFault) -> ErrorDisposition;
}

type Reply = oneshot::Sender<Result<Value, QueueError>>;

struct Envelope {
    message: Message,
    reply: Option<Reply>,
}

#[derive(Debug)]
struct QueueStats {
    queued: AtomicUsize,
    in_flight: AtomicBool,
    completed: AtomicU64,
    last_seen: AtomicU64,
}

/// Sentinel for "progress never checked".
const NEVER_CHECKED: u64 = u64::MAX;

/// Cloneable handle for submitting work.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    stats: Arc<QueueStats>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("pending", &self.pending())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Receiving end of the queue. Turned into a running worker by [`QueueWorker::run`].
pub struct QueueWorker {
    rx: mpsc::UnboundedReceiver<Envelope>,
    stats: Arc<QueueStats>,
    cancel: CancellationToken,
}

/// Create a connected handle and worker.
pub fn channel() -> (QueueHandle, QueueWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(QueueStats {
        queued: AtomicUsize::new(0),
        in_flight: AtomicBool::new(false),
        completed: AtomicU64::new(0),
        last_seen: AtomicU64::new(NEVER_CHECKED),
    });
    let cancel = CancellationToken::new();
    (
        QueueHandle {
            tx,
            stats: stats.clone(),
            closing: Arc::new(AtomicBool::new(false)),
            cancel: cancel.clone(),
        },
        QueueWorker { rx, stats, cancel },
    )
}

impl QueueHandle {
    fn push(&self, message: Message, reply: Option<Reply>) -> Result<(), QueueError> {
        if self.is_closing() {
            return Err(QueueError::ShuttingDown);
        }
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Envelope { message, reply }).is_err() {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Queue a message and wait for its transaction to finish.
    pub async fn enqueue(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<Value, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.push(Message::new(method, args, options), Some(reply_tx))?;
        reply_rx.await.map_err(|_| QueueError::Closed)?
    }

    /// Queue a message without waiting for it.
    pub fn enqueue_detached(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        self.push(Message::new(method, args, options), None)
    }

    /// Messages queued or running.
    pub fn pending(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
            + usize::from(self.stats.in_flight.load(Ordering::SeqCst))
    }

    /// Transactions finished so far, successful or not.
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::SeqCst)
    }

    /// Liveness check.
    ///
    /// False only if work is pending and nothing completed since the previous
    /// call. Each call moves the watermark, so there must be one caller.
    pub fn progress(&self) -> bool {
        let completed = self.completed();
        let last = self.stats.last_seen.swap(completed, Ordering::SeqCst);
        !(completed == last && self.pending() > 0)
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Refuse new work and stop the worker after the in-flight transaction.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let unprocessed = self.stats.queued.load(Ordering::SeqCst);
        if unprocessed > 0 {
            warn!(unprocessed, "Shutting down with unprocessed messages");
        }
        self.cancel.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_isolated<T: Transactional>(
    target: &mut T,
    message: &Message,
) -> Result<Value, TransactionFault> {
    let outcome = AssertUnwindSafe(async {
        target.begin(message).await?;
        let value = target.execute(message).await?;
        target.prepare().await?;
        target.commit().await?;
        Ok(value)
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(TransactionFault::Panicked(panic_message(payload.as_ref()))),
    }
}

impl QueueWorker {
    /// Take every queued message without running it.
    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            messages.push(envelope.message);
        }
        messages
    }

    /// Process messages one at a time until the queue is closed.
    pub async fn run<T: Transactional>(mut self, mut target: T, shutdown: ShutdownController) {
        debug!("Message queue worker started");

        loop {
            let envelope = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                next = self.rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            self.stats.in_flight.store(true, Ordering::SeqCst);
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);

            let Envelope { message, reply } = envelope;
            trace!(method = %message.method, "Processing message");

            let result = match run_isolated(&mut target, &message).await {
                Ok(value) => Ok(value),
                Err(fault) => {
                    handle_fault(&mut target, &message, &fault, &shutdown).await;
                    Err(QueueError::Transaction(fault))
                }
            };

            self.stats.completed.fetch_add(1, Ordering::SeqCst);
            self.stats.in_flight.store(false, Ordering::SeqCst);

            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }

        debug!("Message queue worker stopped");
    }
}

async fn handle_fault<T: Transactional>(
    target: &mut T,
    message: &Message,
    fault: &TransactionFault,
    shutdown: &ShutdownController,
) {
    warn!(
        method = %message.method,
        code = fault.error_code(),
        error = %fault,
        "Transaction failed"
    );

    let disposition = match std::panic::catch_unwind(AssertUnwindSafe(|| target.on_error(fault))) {
        Ok(disposition) => disposition,
        Err(payload) => {
            error!(panic = %panic_message(payload.as_ref()), "Error hook panicked");
            ErrorDisposition::Propagate
        }
    };

    if disposition == ErrorDisposition::Absorb {
        match AssertUnwindSafe(target.abort()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(method = %message.method, "Transaction aborted");
                return;
            }
            Ok(Err(e)) => error!(error = %e, "Abort failed"),
            Err(payload) => error!(panic = %panic_message(payload.as_ref()), "Abort panicked"),
        }
    }

    error!(
        method = %message.method,
        code = fault.error_code(),
        "Error in handler, forcing shutdown"
    );
    shutdown.trigger_or_exit(ShutdownReason::Fault {
        code: fault.error_code(),
        message: fault.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records lifecycle calls; `hang` never finishes, `fail` errors, `panic` panics.
    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        disposition: Option<ErrorDisposition>,
    }

    #[async_trait]
    impl Transactional for Recorder {
        async fn begin(&mut self, message: &Message) -> Result<(), TransactionFault> {
            self.log.lock().unwrap().push(format!("begin:{}", message.method));
            Ok(())
        }

        async fn execute(&mut self, message: &Message) -> Result<Value, TransactionFault> {
            match message.method.as_str() {
                "hang" => std::future::pending::<Result<Value, TransactionFault>>().await,
                "fail" => Err(TransactionFault::Handler {
                    method: "fail".into(),
                    message: "nope".into(),
                }),
                "panic" => panic!("handler exploded"),
                other => Ok(json!({ "echo": other, "args": message.args })),
            }
        }

        async fn prepare(&mut self) -> Result<(), TransactionFault> {
            self.log.lock().unwrap().push("prepare".into());
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), TransactionFault> {
            self.log.lock().unwrap().push("commit".into());
            Ok(())
        }

        async fn abort(&mut self) -> Result<(), TransactionFault> {
            self.log.lock().unwrap().push("abort".into());
            Ok(())
        }

        fn on_error(&self, _fault: &TransactionFault) -> ErrorDisposition {
            self.disposition.unwrap_or_default()
        }
    }

    fn start(recorder: Recorder) -> (QueueHandle, ShutdownController) {
        let (handle, worker) = channel();
        let closer = handle.clone();
        let shutdown = ShutdownController::builder()
            .hook("queue", move || {
                closer.close();
                Ok(())
            })
            .exit_hook(|_| panic!("exit must not be called"))
            .build();
        tokio::spawn(worker.run(recorder, shutdown.clone()));
        (handle, shutdown)
    }

    #[tokio::test]
    async fn test_runs_lifecycle_in_order() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let (queue, _shutdown) = start(recorder);

        let value = queue
            .enqueue("hello", vec![json!(1)], EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!({"echo": "hello", "args": [1]}));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["begin:hello", "prepare", "commit"]
        );
        assert_eq!(queue.completed(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_absorbed_fault_aborts_and_continues() {
        let recorder = Recorder {
            disposition: Some(ErrorDisposition::Absorb),
            ..Default::default()
        };
        let log = recorder.log.clone();
        let (queue, shutdown) = start(recorder);

        let err = queue
            .enqueue("fail", vec![], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "HANDLER_ERROR");
        assert!(!shutdown.is_triggered());

        queue
            .enqueue("next", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["begin:fail", "abort", "begin:next", "prepare", "commit"]
        );
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let recorder = Recorder {
            disposition: Some(ErrorDisposition::Absorb),
            ..Default::default()
        };
        let (queue, _shutdown) = start(recorder);

        let err = queue
            .enqueue("panic", vec![], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::Transaction(TransactionFault::Panicked("handler exploded".into()))
        );

        // Worker survived.
        assert!(queue.enqueue("ok", vec![], EnqueueOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_propagated_fault_shuts_down() {
        let (queue, shutdown) = start(Recorder::default());

        let err = queue
            .enqueue("fail", vec![], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Transaction(_)));

        assert!(matches!(
            shutdown.wait().await,
            ShutdownReason::Fault { code: "HANDLER_ERROR", .. }
        ));
        assert_eq!(
            queue.enqueue_detached("late", vec![], EnqueueOptions::default()),
            Err(QueueError::ShuttingDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_detects_stuck_queue() {
        let (queue, _shutdown) = start(Recorder::default());

        // Empty queue always makes progress.
        let (idle, _worker) = channel();
        assert!(idle.progress());
        assert!(idle.progress());

        queue
            .enqueue_detached("hang", vec![], EnqueueOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.pending(), 1);
        assert!(queue.progress());
        assert!(!queue.progress());
        assert!(!queue.progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_recovers_after_completion() {
        let (queue, _shutdown) = start(Recorder::default());
        queue
            .enqueue("a", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        assert!(queue.progress());

        queue
            .enqueue_detached("hang", vec![], EnqueueOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queue.progress());
    }

    #[tokio::test]
    async fn test_close_rejects_and_drops_queued() {
        let (queue, worker) = channel();
        queue
            .enqueue_detached("a", vec![], EnqueueOptions::default())
            .unwrap();
        let mut waiting = Box::pin(queue.enqueue("b", vec![], EnqueueOptions::default()));
        assert!(futures::poll!(&mut waiting).is_pending());
        assert_eq!(queue.pending(), 2);

        queue.close();
        assert_eq!(
            queue.enqueue_detached("c", vec![], EnqueueOptions::default()),
            Err(QueueError::ShuttingDown)
        );

        // Worker sees the cancelled token first and drops what is queued.
        worker
            .run(Recorder::default(), ShutdownController::builder().build())
            .await;
        assert_eq!(waiting.await, Err(QueueError::Closed));
    }
}
