// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transactional synchronization engine.
//!
//! The engine owns both replicas and the application state. It is driven by
//! the queue worker, one transaction at a time:
//!
//! ```text
//!            mailbox ──► begin ──► execute ──► prepare ──► commit
//!               ▲                                            │
//!               │                                        UploadJob
//!               │                                            ▼
//!               └──────────── uploader task ──► CloudSession::sync
//! ```
//!
//! Uploads run in commit order on a separate task, so a slow cloud never
//! blocks the queue. A failed upload is parked in the mailbox and fails the
//! *next* transaction at `begin`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tether_replica::{Changes, MapRef, SharedMap, channel};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bundle::Bundle;
use crate::clock::CorrectedClock;
use crate::cloud::{BundleAck, CloudSession, FROM_CLOUD_CHANNEL, FROM_CLOUD_REPLY_CHANNEL};
use crate::cron::CronTable;
use crate::error::{CloudError, TransactionFault};
use crate::handler::{
    Application, ErrorDisposition, MethodTable, PULSE_METHOD, SETUP_METHOD, TxContext,
};
use crate::nap::NapMailbox;
use crate::queue::{EnqueueOptions, Message, QueueHandle, Transactional};
use crate::scheduler::BundleScheduler;

/// Bounded record of the most recent bundle acknowledgements.
///
/// When full, the oldest entry by arrival is dropped.
#[derive(Debug, Clone)]
pub struct AckHistory {
    entries: Arc<Mutex<VecDeque<BundleAck>>>,
    capacity: usize,
}

impl AckHistory {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BundleAck>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn extend(&self, acks: impl IntoIterator<Item = BundleAck>) {
        let mut entries = self.lock();
        for ack in acks {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(ack);
        }
    }

    /// Maximum number of entries kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries, oldest first.
    pub fn snapshot(&self) -> Vec<BundleAck> {
        self.lock().iter().copied().collect()
    }
}

/// Outcome of the latest upload, waiting for the next `begin`.
#[derive(Debug)]
enum PendingSyncResult {
    Incoming(Changes),
    Failed(CloudError),
}

#[derive(Debug, Clone, Default)]
struct Mailbox(Arc<Mutex<Option<PendingSyncResult>>>);

impl Mailbox {
    fn lock(&self) -> MutexGuard<'_, Option<PendingSyncResult>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an upload result. A parked failure is kept until taken.
    fn store(&self, result: PendingSyncResult) {
        let mut slot = self.lock();
        if matches!(*slot, Some(PendingSyncResult::Failed(_))) {
            if let PendingSyncResult::Failed(e) = &result {
                debug!(error = %e, "Sync failure already pending, dropping");
            }
            return;
        }
        *slot = Some(result);
    }

    fn take(&self) -> Option<PendingSyncResult> {
        self.lock().take()
    }

    fn clear(&self) {
        self.lock().take();
    }
}

struct UploadJob {
    changes: Changes,
    full_cycle: bool,
}

/// Open transaction.
struct Transaction {
    snapshot: Value,
    to_cloud: MapRef,
    from_cloud: MapRef,
    options: EnqueueOptions,
    acks: Vec<BundleAck>,
}

/// Everything the engine needs from the runtime.
pub(crate) struct EngineParts {
    pub cloud: Arc<dyn CloudSession>,
    pub application: Arc<dyn Application>,
    pub methods: MethodTable,
    pub scheduler: BundleScheduler,
    pub cron: CronTable,
    pub clock: Arc<CorrectedClock>,
    pub queue: QueueHandle,
    pub ack_history_size: usize,
    pub nap: Option<NapMailbox>,
}

/// Owns the replicas and application state; implements [`Transactional`].
pub struct SyncEngine {
    to_cloud: SharedMap,
    from_cloud: SharedMap,
    state: Value,
    scratch: Map<String, Value>,
    current: Option<Transaction>,
    mailbox: Mailbox,
    uploads: mpsc::UnboundedSender<UploadJob>,
    uploader: JoinHandle<()>,
    acks: AckHistory,
    cloud: Arc<dyn CloudSession>,
    application: Arc<dyn Application>,
    methods: MethodTable,
    scheduler: BundleScheduler,
    cron: CronTable,
    clock: Arc<CorrectedClock>,
    queue: QueueHandle,
    nap: Option<NapMailbox>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("to_cloud_version", &self.to_cloud.version())
            .field("from_cloud_version", &self.from_cloud.version())
            .field("in_transaction", &self.current.is_some())
            .field("methods", &self.methods)
            .finish()
    }
}

impl SyncEngine {
    /// Create the engine and spawn its uploader. The uploader stops when
    /// `shutdown` is cancelled.
    pub(crate) fn new(parts: EngineParts, shutdown: CancellationToken) -> Self {
        let (uploads, rx) = mpsc::unbounded_channel();
        let mailbox = Mailbox::default();
        let uploader = tokio::spawn(run_uploader(
            parts.cloud.clone(),
            parts.clock.clone(),
            mailbox.clone(),
            parts.queue.clone(),
            rx,
            shutdown,
        ));

        Self {
            to_cloud: SharedMap::new(),
            from_cloud: SharedMap::new(),
            state: Value::Object(Map::new()),
            scratch: Map::new(),
            current: None,
            mailbox,
            uploads,
            uploader,
            acks: AckHistory::new(parts.ack_history_size),
            cloud: parts.cloud,
            application: parts.application,
            methods: parts.methods,
            scheduler: parts.scheduler,
            cron: parts.cron,
            clock: parts.clock,
            queue: parts.queue,
            nap: parts.nap,
        }
    }

    /// Load both replicas from the cloud, discarding local contents.
    #[instrument(skip_all)]
    pub async fn resume(&mut self) -> Result<(), CloudError> {
        let snapshot = self.cloud.resume().await?;

        let mut to_cloud = SharedMap::new();
        to_cloud
            .apply_changes(&snapshot.to_cloud)
            .map_err(|e| CloudError::Protocol(e.to_string()))?;
        let mut from_cloud = SharedMap::new();
        from_cloud
            .apply_changes(&snapshot.from_cloud)
            .map_err(|e| CloudError::Protocol(e.to_string()))?;

        self.to_cloud = to_cloud;
        self.from_cloud = from_cloud;
        self.current = None;
        self.mailbox.clear();
        self.clock.set_offset(self.cloud.estimated_time_offset_ms());

        info!(
            to_cloud_version = self.to_cloud.version(),
            from_cloud_version = self.from_cloud.version(),
            "Resumed replicas from cloud"
        );
        Ok(())
    }

    /// Stable device → cloud replica.
    pub fn to_cloud(&self) -> &SharedMap {
        &self.to_cloud
    }

    /// Stable cloud → device replica.
    pub fn from_cloud(&self) -> &SharedMap {
        &self.from_cloud
    }

    /// Application state as of the last finished transaction.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Shared handle to the acknowledgement history.
    pub fn acks(&self) -> AckHistory {
        self.acks.clone()
    }

    /// True while the uploader task is alive.
    pub fn is_uploading(&self) -> bool {
        !self.uploader.is_finished() && !self.uploads.is_closed()
    }

    /// Hand every new bundle in the downlink channel to the scheduler and
    /// queue an acknowledgement for each.
    fn deliver_bundles(
        tx: &mut Transaction,
        scheduler: &BundleScheduler,
    ) -> Result<usize, TransactionFault> {
        let received = channel::receive(&mut tx.to_cloud, &tx.from_cloud, FROM_CLOUD_CHANNEL)?;
        let count = received.messages.len();

        for (offset, raw) in received.messages.into_iter().enumerate() {
            let index = received.index + offset as u64;
            let result = match Bundle::from_value(raw) {
                Ok(bundle) => scheduler.submit(&bundle),
                Err(e) => {
                    warn!(index, error = %e, "Discarding malformed bundle");
                    false
                }
            };
            channel::send(
                &mut tx.to_cloud,
                FROM_CLOUD_REPLY_CHANNEL,
                vec![json!({ "result": result, "index": index })],
            )?;
            tx.acks.push(BundleAck { index, result });
        }

        if count > 0 {
            debug!(count, first_index = received.index, "Delivered bundles");
        }
        Ok(count)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.uploader.abort();
    }
}

#[async_trait]
impl Transactional for SyncEngine {
    async fn begin(&mut self, message: &Message) -> Result<(), TransactionFault> {
        match self.mailbox.take() {
            Some(PendingSyncResult::Failed(e)) => return Err(TransactionFault::Sync(e)),
            Some(PendingSyncResult::Incoming(changes)) => {
                let mut from_cloud = SharedMap::new();
                from_cloud.apply_changes(&changes)?;
                self.from_cloud = from_cloud;
            }
            None => {}
        }

        self.current = Some(Transaction {
            snapshot: self.state.clone(),
            to_cloud: self.to_cloud.reference(),
            from_cloud: self.from_cloud.reference_read_only(),
            options: message.options,
            acks: Vec::new(),
        });
        Ok(())
    }

    async fn execute(&mut self, message: &Message) -> Result<Value, TransactionFault> {
        let tx = self
            .current
            .as_mut()
            .ok_or(TransactionFault::NoTransaction)?;

        if message.method == PULSE_METHOD {
            Self::deliver_bundles(tx, &self.scheduler)?;
        }

        let mut ctx = TxContext {
            state: &mut self.state,
            scratch: &mut self.scratch,
            to_cloud: &mut tx.to_cloud,
            from_cloud: &tx.from_cloud,
            scheduler: &self.scheduler,
            cron: &self.cron,
            clock: self.clock.as_ref(),
            queue: &self.queue,
            nap: self.nap.as_ref(),
        };

        let outcome = match message.method.as_str() {
            PULSE_METHOD => self.application.pulse(&mut ctx).await.map(|()| Value::Null),
            SETUP_METHOD => self.application.setup(&mut ctx).await.map(|()| Value::Null),
            name => match self.methods.get(name) {
                Some(method) => method.call(&mut ctx, message.args.clone()).await,
                None => return Err(TransactionFault::UnknownMethod(name.to_string())),
            },
        };

        outcome.map_err(|e| TransactionFault::Handler {
            method: message.method.clone(),
            message: format!("{e:#}"),
        })
    }

    async fn prepare(&mut self) -> Result<(), TransactionFault> {
        let tx = self
            .current
            .as_mut()
            .ok_or(TransactionFault::NoTransaction)?;
        let pruned = channel::gc(&mut tx.to_cloud, &tx.from_cloud)
            .map_err(|e| TransactionFault::Prepare(e.to_string()))?;
        if pruned > 0 {
            debug!(pruned, "Pruned acknowledged channel messages");
        }
        tx.to_cloud.prepare();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionFault> {
        let tx = self.current.as_ref().ok_or(TransactionFault::NoTransaction)?;
        if !tx.options.skip_sync && self.uploads.is_closed() {
            return Err(TransactionFault::Commit("uploader stopped".to_string()));
        }

        let changes = tx.to_cloud.changes();
        self.to_cloud
            .commit(&tx.to_cloud)
            .map_err(|e| TransactionFault::Commit(e.to_string()))?;

        let Some(tx) = self.current.take() else {
            return Err(TransactionFault::NoTransaction);
        };
        self.acks.extend(tx.acks);

        if tx.options.skip_sync {
            return Ok(());
        }
        let job = UploadJob {
            changes,
            full_cycle: tx.options.full_cycle,
        };
        if self.uploads.send(job).is_err() {
            warn!(version = self.to_cloud.version(), "Uploader stopped, diff not uploaded");
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), TransactionFault> {
        if let Some(tx) = self.current.take() {
            self.state = tx.snapshot;
        }
        Ok(())
    }

    fn on_error(&self, fault: &TransactionFault) -> ErrorDisposition {
        self.application.on_error(fault)
    }
}

async fn run_uploader(
    cloud: Arc<dyn CloudSession>,
    clock: Arc<CorrectedClock>,
    mailbox: Mailbox,
    queue: QueueHandle,
    mut rx: mpsc::UnboundedReceiver<UploadJob>,
    shutdown: CancellationToken,
) {
    debug!("Uploader started");

    loop {
        let job = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            next = rx.recv() => match next {
                Some(job) => job,
                None => break,
            },
        };

        let version = job.changes.version;
        let result = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            result = cloud.sync(job.changes) => result,
        };
        clock.set_offset(cloud.estimated_time_offset_ms());

        match result {
            Ok(incoming) => {
                debug!(version, from_cloud_version = incoming.version, "Synced with cloud");
                mailbox.store(PendingSyncResult::Incoming(incoming));
                if job.full_cycle {
                    let follow_up =
                        queue.enqueue_detached(PULSE_METHOD, Vec::new(), EnqueueOptions::default());
                    if let Err(e) = follow_up {
                        debug!(error = %e, "Could not enqueue follow-up pulse");
                    }
                }
            }
            Err(e) => {
                warn!(version, code = e.error_code(), error = %e, "Sync failed");
                mailbox.store(PendingSyncResult::Failed(e));
            }
        }
    }

    debug!("Uploader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::StartHint;
    use crate::clock::{Clock, ManualClock};
    use crate::cloud::LoopbackCloud;
    use crate::handler::NoopApplication;
    use crate::queue::{self, QueueWorker};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        engine: SyncEngine,
        cloud: LoopbackCloud,
        worker: QueueWorker,
        token: CancellationToken,
    }

    fn methods() -> MethodTable {
        let mut methods = MethodTable::new();
        methods.register_fn("touch", |ctx, args| {
            let value = args.first().cloned().unwrap_or(Value::Null);
            ctx.to_cloud.set("touched", value.clone())?;
            ctx.state["touched"] = value.clone();
            Ok(value)
        });
        methods.register_fn("explode", |ctx, _args| {
            ctx.state["dirty"] = json!(true);
            ctx.scratch.insert("attempts".into(), json!(1));
            ctx.to_cloud.set("dirty", json!(true))?;
            anyhow::bail!("kaboom")
        });
        methods
    }

    fn harness(ack_history_size: usize) -> Harness {
        let cloud = LoopbackCloud::new();
        let source: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));
        let clock = Arc::new(CorrectedClock::new(source, 50));
        let (queue, worker) = queue::channel();
        let token = CancellationToken::new();
        let parts = EngineParts {
            cloud: Arc::new(cloud.clone()),
            application: Arc::new(NoopApplication),
            methods: methods(),
            scheduler: BundleScheduler::new(clock.clone(), queue.clone()),
            cron: CronTable::new(queue.clone()),
            clock,
            queue,
            ack_history_size,
            nap: None,
        };
        Harness {
            engine: SyncEngine::new(parts, token.clone()),
            cloud,
            worker,
            token,
        }
    }

    async fn run(
        engine: &mut SyncEngine,
        method: &str,
        args: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<Value, TransactionFault> {
        let message = Message::new(method, args, options);
        let outcome = async {
            engine.begin(&message).await?;
            let value = engine.execute(&message).await?;
            engine.prepare().await?;
            engine.commit().await?;
            Ok(value)
        }
        .await;
        if outcome.is_err() {
            engine.abort().await.unwrap();
        }
        outcome
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn now_bundle(method: &str) -> Bundle {
        let mut bundle = Bundle::new(0);
        bundle.append(method, 0, vec![json!(1)]).unwrap();
        bundle.freeze_at(StartHint::Now, T0).unwrap();
        bundle
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_delivers_and_acks_bundles() {
        let mut h = harness(16);
        h.cloud.send_bundle(&now_bundle("down")).unwrap();
        h.engine.resume().await.unwrap();

        run(&mut h.engine, PULSE_METHOD, vec![], EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(
            h.engine.acks().snapshot(),
            vec![BundleAck { index: 0, result: true }]
        );

        settle().await;
        assert_eq!(h.cloud.acks(), vec![BundleAck { index: 0, result: true }]);
        assert_eq!(h.cloud.undelivered(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let fired: Vec<String> = h.worker.drain().into_iter().map(|m| m.method).collect();
        assert_eq!(fired, vec!["down"]);
    }

    #[tokio::test]
    async fn test_malformed_bundle_is_nacked() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        let mut garbage = h.engine.from_cloud.reference();
        channel::send(&mut garbage, FROM_CLOUD_CHANNEL, vec![json!("not a bundle")]).unwrap();
        garbage.prepare();
        h.engine.from_cloud.commit(&garbage).unwrap();

        run(&mut h.engine, PULSE_METHOD, vec![], EnqueueOptions::skip_sync())
            .await
            .unwrap();
        assert_eq!(
            h.engine.acks().snapshot(),
            vec![BundleAck { index: 0, result: false }]
        );
    }

    #[tokio::test]
    async fn test_unrepresentable_start_is_nacked() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        let mut downlink = h.engine.from_cloud.reference();
        channel::send(
            &mut downlink,
            FROM_CLOUD_CHANNEL,
            vec![
                json!({ "start": i64::MIN, "commands": [] }),
                now_bundle("down").to_value().unwrap(),
            ],
        )
        .unwrap();
        downlink.prepare();
        h.engine.from_cloud.commit(&downlink).unwrap();

        run(&mut h.engine, PULSE_METHOD, vec![], EnqueueOptions::skip_sync())
            .await
            .unwrap();
        assert_eq!(
            h.engine.acks().snapshot(),
            vec![
                BundleAck { index: 0, result: false },
                BundleAck { index: 1, result: true },
            ]
        );
        assert_eq!(
            channel::first_ack_index(&h.engine.to_cloud().reference_read_only(), FROM_CLOUD_CHANNEL)
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_prepare_failure_leaves_replica_and_state() {
        let mut h = harness(16);
        h.cloud.send_bundle(&now_bundle("down")).unwrap();
        h.engine.resume().await.unwrap();
        run(&mut h.engine, PULSE_METHOD, vec![], EnqueueOptions::skip_sync())
            .await
            .unwrap();
        run(&mut h.engine, "touch", vec![json!("a")], EnqueueOptions::skip_sync())
            .await
            .unwrap();
        assert!(h.engine.to_cloud().has(FROM_CLOUD_REPLY_CHANNEL));

        // The cloud acknowledges the reply channel with something unreadable.
        let mut broken = h.engine.from_cloud.reference();
        broken
            .set(channel::ack_key(FROM_CLOUD_REPLY_CHANNEL), json!("soon"))
            .unwrap();
        broken.prepare();
        h.engine.from_cloud.commit(&broken).unwrap();

        let version = h.engine.to_cloud().version();
        let replica = h.engine.to_cloud().snapshot();
        let state = h.engine.state().clone();

        let err = run(&mut h.engine, "touch", vec![json!("b")], EnqueueOptions::skip_sync())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PREPARE_FAILURE");
        assert_eq!(h.engine.to_cloud().version(), version);
        assert_eq!(h.engine.to_cloud().snapshot(), replica);
        assert_eq!(h.engine.state(), &state);
        assert_eq!(h.engine.state()["touched"], json!("a"));
    }

    #[tokio::test]
    async fn test_sync_failure_surfaces_at_next_begin() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        h.cloud.fail_next_sync(CloudError::Transport("link down".into()));

        run(&mut h.engine, "touch", vec![json!(1)], EnqueueOptions::default())
            .await
            .unwrap();
        settle().await;

        let err = run(&mut h.engine, "touch", vec![json!(2)], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransactionFault::Sync(CloudError::Transport("link down".into())));
        assert_eq!(err.error_code(), "SYNC_FAILURE");
        assert_eq!(h.engine.state()["touched"], json!(1));

        // The failure is reported once.
        assert!(
            run(&mut h.engine, "touch", vec![json!(3)], EnqueueOptions::skip_sync())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_replica_and_state() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        run(&mut h.engine, "touch", vec![json!("a")], EnqueueOptions::default())
            .await
            .unwrap();
        let version = h.engine.to_cloud().version();

        let err = run(&mut h.engine, "explode", vec![], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransactionFault::Handler {
                method: "explode".into(),
                message: "kaboom".into()
            }
        );
        assert_eq!(h.engine.to_cloud().version(), version);
        assert!(!h.engine.to_cloud().has("dirty"));
        assert_eq!(h.engine.state(), &json!({ "touched": "a" }));
        assert_eq!(h.engine.scratch.get("attempts"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let mut h = harness(16);
        let err = run(&mut h.engine, "fly", vec![], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransactionFault::UnknownMethod("fly".into()));
    }

    #[tokio::test]
    async fn test_skip_sync_commits_without_upload() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        run(&mut h.engine, "touch", vec![json!(1)], EnqueueOptions::skip_sync())
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.engine.to_cloud().version(), 1);
        assert_eq!(h.cloud.sync_count(), 0);

        run(&mut h.engine, "touch", vec![json!(2)], EnqueueOptions::default())
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.cloud.sync_count(), 1);
    }

    #[tokio::test]
    async fn test_full_cycle_enqueues_follow_up_pulse() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        run(&mut h.engine, "touch", vec![json!(1)], EnqueueOptions::full_cycle())
            .await
            .unwrap();
        settle().await;

        let queued = h.worker.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].method, PULSE_METHOD);
        assert!(!queued[0].options.full_cycle);
        assert_eq!(h.cloud.device_value("touched"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_ack_history_drops_oldest() {
        let mut h = harness(2);
        for _ in 0..3 {
            h.cloud.send_bundle(&now_bundle("down")).unwrap();
        }
        h.engine.resume().await.unwrap();
        run(&mut h.engine, PULSE_METHOD, vec![], EnqueueOptions::skip_sync())
            .await
            .unwrap();

        let indices: Vec<u64> = h.engine.acks().snapshot().iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(h.engine.acks().capacity(), 2);
    }

    #[tokio::test]
    async fn test_commit_refused_after_uploader_stops() {
        let mut h = harness(16);
        h.engine.resume().await.unwrap();
        h.token.cancel();
        settle().await;
        assert!(!h.engine.is_uploading());

        let err = run(&mut h.engine, "touch", vec![json!(1)], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "COMMIT_FAILURE");
        assert_eq!(h.engine.to_cloud().version(), 0);

        // Local-only work is still possible.
        run(&mut h.engine, "touch", vec![json!(1)], EnqueueOptions::skip_sync())
            .await
            .unwrap();
        assert_eq!(h.engine.to_cloud().version(), 1);
    }
}
