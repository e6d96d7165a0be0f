use crate::config::ReindexConfig;
use crate::identity::OrchestrationId;
use crate::liveness::{LiveRun, LivenessTracker};
use crate::notify::{deliver, NotificationSink, ReindexEvent};
use crate::pipeline::{self, PipelineContext};
use crate::state::{
    unix_now_ms, Applied, ItemLedger, ItemReport, OrchestrationState, OrchestrationStatus,
};
use crate::store::StateStore;
use crate::target::{ItemReindexer, TargetCatalog, TargetDescriptor};
use crate::{ReindexError, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const COMMAND_BUFFER: usize = 256;

/// Outcome of a start request: either a new run or an attach to a live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachResult {
    pub id: OrchestrationId,
    /// Reason of the run now in progress (the first caller's, on attach).
    pub reason: String,
    pub already_running: bool,
}

pub(crate) enum RunCommand {
    SetTotals {
        total: u64,
        per_source: BTreeMap<String, u64>,
    },
    Item(ItemReport),
    Complete {
        status: OrchestrationStatus,
        error: Option<String>,
    },
}

/// Write side handed to the execution pipeline. Every report is funnelled
/// through the run owner, which applies them one at a time.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    id: OrchestrationId,
    commands: mpsc::Sender<RunCommand>,
}

impl ProgressReporter {
    pub(crate) async fn set_totals(&self, total: u64, per_source: BTreeMap<String, u64>) {
        self.send(RunCommand::SetTotals { total, per_source }).await;
    }

    pub(crate) async fn item(&self, report: ItemReport) {
        self.send(RunCommand::Item(report)).await;
    }

    pub(crate) async fn complete(&self, status: OrchestrationStatus, error: Option<String>) {
        self.send(RunCommand::Complete { status, error }).await;
    }

    async fn send(&self, command: RunCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Run {} no longer accepts reports", self.id);
        }
    }
}

/// Single logical owner per orchestration identity.
///
/// `start` either attaches to the live run for an identity or begins a new
/// one in a detached task; at most one pipeline per identity is live at any
/// instant in this process, and the store's compare-and-swap extends that
/// guarantee to other processes sharing the store.
#[derive(Clone)]
pub struct ReindexCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: Arc<dyn StateStore>,
    catalog: Arc<dyn TargetCatalog>,
    reindexer: Arc<dyn ItemReindexer>,
    sink: Arc<dyn NotificationSink>,
    config: ReindexConfig,
    liveness: LivenessTracker,
    start_locks: TokioMutex<HashMap<OrchestrationId, Arc<TokioMutex<()>>>>,
}

impl ReindexCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<dyn TargetCatalog>,
        reindexer: Arc<dyn ItemReindexer>,
        sink: Arc<dyn NotificationSink>,
        config: ReindexConfig,
    ) -> Self {
        let config = config.normalized();
        let liveness = LivenessTracker::new(Uuid::new_v4().to_string(), config.liveness_timeout());
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                catalog,
                reindexer,
                sink,
                config,
                liveness,
                start_locks: TokioMutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReindexConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn liveness(&self) -> &LivenessTracker {
        &self.inner.liveness
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn TargetCatalog> {
        &self.inner.catalog
    }

    /// Begin a run for `target`, or attach to the one already in progress.
    ///
    /// Returns as soon as the run is accepted. A `Running` record whose owner
    /// is no longer alive is treated as stale and replaced by a fresh run.
    /// Cancelling `cancel` stops dispatching new items and fails the run with
    /// the error "cancelled".
    pub async fn start(
        &self,
        id: &OrchestrationId,
        target: TargetDescriptor,
        reason: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<AttachResult> {
        let expected = OrchestrationId::resolve(target.kind, &target.key)?;
        if &expected != id {
            return Err(ReindexError::InvalidTarget(format!(
                "orchestration id {id} does not address {} '{}' (expected {expected})",
                target.kind, target.key
            )));
        }

        let key_lock = self.start_lock(id).await;
        let _serialized = key_lock.lock().await;
        let inner = &self.inner;

        let existing = inner.store.load(id).await?;
        if let Some(record) = existing.as_ref() {
            if record.status == OrchestrationStatus::Running {
                if inner.liveness.is_active(id, Some(record)) {
                    info!("Reindex {id} already running; attaching");
                    return Ok(AttachResult {
                        id: id.clone(),
                        reason: record.reason.clone(),
                        already_running: true,
                    });
                }
                warn!("Detected stale Running state for {id}; starting a new run");
            }
        }

        let mut fresh = OrchestrationState::begin_run(
            id,
            reason,
            inner.liveness.owner_token(),
            existing.as_ref(),
            unix_now_ms(),
        );

        match inner.store.compare_and_swap(&fresh).await {
            Ok(version) => fresh.version = version,
            Err(ReindexError::VersionConflict { .. }) => {
                // Another process wrote first; attach to it if it is live.
                let current = inner.store.load(id).await?;
                if let Some(record) = current.filter(|r| inner.liveness.is_active(id, Some(r))) {
                    info!("Reindex {id} was started concurrently elsewhere; attaching");
                    return Ok(AttachResult {
                        id: id.clone(),
                        reason: record.reason,
                        already_running: true,
                    });
                }
                return Err(ReindexError::VersionConflict { id: id.to_string() });
            }
            Err(err) => return Err(err),
        }

        info!("Starting reindex {id} with reason: {reason}");
        self.spawn_run(fresh, target, cancel);

        Ok(AttachResult {
            id: id.clone(),
            reason: reason.to_string(),
            already_running: false,
        })
    }

    /// Current record for `id`; a never-started identity yields `NotStarted`.
    pub async fn get_state(&self, id: &OrchestrationId) -> Result<OrchestrationState> {
        if let Some(run) = self.inner.liveness.live(id) {
            return Ok(run.state.borrow().clone());
        }
        Ok(self
            .inner
            .store
            .load(id)
            .await?
            .unwrap_or_else(|| OrchestrationState::not_started(id)))
    }

    /// Whether work for `id` is actually proceeding, as opposed to a record
    /// that merely says `Running`.
    pub async fn is_running(&self, id: &OrchestrationId) -> Result<bool> {
        if self.inner.liveness.live(id).is_some() {
            return Ok(true);
        }
        let record = self.inner.store.load(id).await?;
        Ok(self.inner.liveness.is_active(id, record.as_ref()))
    }

    /// Push one item outcome into the live run for `id`.
    pub async fn report_progress(&self, id: &OrchestrationId, report: ItemReport) -> Result<()> {
        self.send(id, RunCommand::Item(report)).await
    }

    /// Move the live run for `id` to `Completed` or `Failed`.
    pub async fn complete(
        &self,
        id: &OrchestrationId,
        status: OrchestrationStatus,
        error: Option<String>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(ReindexError::Other(format!(
                "cannot complete {id} with non-terminal status {status:?}"
            )));
        }
        self.send(id, RunCommand::Complete { status, error }).await
    }

    /// Request cancellation of the live run for `id`. Returns `false` if
    /// there is none in this process.
    pub fn cancel(&self, id: &OrchestrationId) -> bool {
        match self.inner.liveness.live(id) {
            Some(run) => {
                info!("Cancellation requested for reindex {id}");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the run for `id` reaches a terminal status (or its owner
    /// goes away) and return the final record.
    pub async fn wait(&self, id: &OrchestrationId) -> Result<OrchestrationState> {
        if let Some(run) = self.inner.liveness.live(id) {
            let mut rx = run.state;
            loop {
                if rx.borrow_and_update().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_state(id).await
    }

    /// All known records, with live runs showing their latest in-memory state.
    pub async fn list(&self) -> Result<Vec<OrchestrationState>> {
        let mut records = self.inner.store.list().await?;
        for record in &mut records {
            if let Some(run) = self.inner.liveness.live(&record.id) {
                *record = run.state.borrow().clone();
            }
        }
        Ok(records)
    }

    async fn send(&self, id: &OrchestrationId, command: RunCommand) -> Result<()> {
        let run = self
            .inner
            .liveness
            .live(id)
            .ok_or_else(|| ReindexError::Other(format!("no live run for {id}")))?;
        run.commands
            .send(command)
            .await
            .map_err(|_| ReindexError::Other(format!("run {id} has already finished")))
    }

    async fn start_lock(&self, id: &OrchestrationId) -> Arc<TokioMutex<()>> {
        let mut guard = self.inner.start_locks.lock().await;
        guard
            .entry(id.clone())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    fn spawn_run(
        &self,
        record: OrchestrationState,
        target: TargetDescriptor,
        cancel: Option<CancellationToken>,
    ) {
        let inner = self.inner.clone();
        let id = record.id.clone();
        let run_seq = record.run_seq;
        let cancel = cancel.map_or_else(CancellationToken::new, |parent| parent.child_token());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(record.clone());

        inner.liveness.register(
            id.clone(),
            LiveRun {
                run_seq,
                commands: command_tx.clone(),
                state: state_rx,
                cancel: cancel.clone(),
            },
        );

        let reporter = ProgressReporter {
            id: id.clone(),
            commands: command_tx,
        };
        let owner = RunOwner {
            inner: inner.clone(),
            state: record,
            ledger: ItemLedger::new(),
            state_tx,
            cancel: cancel.clone(),
            lost_ownership: false,
        };
        let handle = tokio::spawn(owner.run(target, command_rx, reporter));
        tokio::spawn(supervise(inner, id, run_seq, cancel, handle));
    }
}

/// Converts a panicking run owner into a `Failed` record.
async fn supervise(
    inner: Arc<CoordinatorInner>,
    id: OrchestrationId,
    run_seq: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
) {
    let Err(err) = handle.await else {
        return;
    };
    error!("Reindex owner for {id} crashed: {err}");
    cancel.cancel();
    inner.liveness.deregister(&id, run_seq);

    let record = match inner.store.load(&id).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(load_err) => {
            warn!("Could not load {id} after owner crash: {load_err}");
            return;
        }
    };
    let ours = record.run_seq == run_seq
        && record.owner.as_deref() == Some(inner.liveness.owner_token());
    if !ours || record.is_terminal() {
        return;
    }
    let mut record = record;
    record.finish(
        OrchestrationStatus::Failed,
        Some(format!("orchestration owner crashed: {err}")),
        unix_now_ms(),
    );
    if let Err(write_err) = inner.store.compare_and_swap(&record).await {
        warn!("Could not record crash of {id}: {write_err}");
    }
    deliver(
        &inner.sink,
        ReindexEvent::Failed {
            id,
            error: record.recent_errors(3),
        },
    )
    .await;
}

/// The task that owns one run: the only writer of its record.
struct RunOwner {
    inner: Arc<CoordinatorInner>,
    state: OrchestrationState,
    ledger: ItemLedger,
    state_tx: watch::Sender<OrchestrationState>,
    cancel: CancellationToken,
    lost_ownership: bool,
}

impl RunOwner {
    async fn run(
        mut self,
        target: TargetDescriptor,
        mut commands: mpsc::Receiver<RunCommand>,
        reporter: ProgressReporter,
    ) {
        let id = self.state.id.clone();
        let run_seq = self.state.run_seq;

        deliver(
            &self.inner.sink,
            ReindexEvent::Started {
                id: id.clone(),
                kind: target.kind,
                key: target.key.clone(),
                reason: self.state.reason.clone(),
            },
        )
        .await;

        let mut pipeline = tokio::spawn(pipeline::execute(PipelineContext {
            target,
            catalog: self.inner.catalog.clone(),
            reindexer: self.inner.reindexer.clone(),
            config: self.inner.config.clone(),
            reporter,
            cancel: self.cancel.clone(),
        }));
        let mut pipeline_done = false;

        let every = self.inner.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(time::Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.state.is_terminal() && !self.lost_ownership {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => self.handle(command).await,
                joined = &mut pipeline, if !pipeline_done => {
                    pipeline_done = true;
                    // Reports sent before the pipeline returned are still queued.
                    while let Ok(command) = commands.try_recv() {
                        self.handle(command).await;
                    }
                    match joined {
                        Err(err) => {
                            error!("Reindex pipeline for {id} crashed: {err}");
                            self.fail(format!("reindex pipeline crashed: {err}")).await;
                        }
                        Ok(()) if !self.state.is_terminal() && !self.lost_ownership => {
                            self.fail("reindex pipeline exited without completing".to_string())
                                .await;
                        }
                        Ok(()) => {}
                    }
                }
                _ = heartbeat.tick() => {
                    self.state.touch(unix_now_ms());
                    self.persist().await;
                }
            }
        }

        if !pipeline_done {
            // Completed externally or lost ownership; stop dispatching.
            self.cancel.cancel();
        }
        self.inner.liveness.deregister(&id, run_seq);
        drop(commands);

        if self.lost_ownership {
            warn!("Reindex {id} run {run_seq} lost ownership to another owner; stopped");
            return;
        }
        self.announce_outcome().await;
    }

    async fn handle(&mut self, command: RunCommand) {
        if self.state.is_terminal() {
            return;
        }
        let now = unix_now_ms();
        match command {
            RunCommand::SetTotals { total, per_source } => {
                self.state.set_totals(total, &per_source, now);
                self.persist().await;
            }
            RunCommand::Item(report) => {
                let applied = self.ledger.apply(&mut self.state, report, now);
                self.persist().await;
                if applied == Applied::Counted && self.progress_milestone() {
                    deliver(
                        &self.inner.sink,
                        ReindexEvent::Progress {
                            id: self.state.id.clone(),
                            total: self.state.total_items,
                            processed: self.state.processed_items,
                            failed: self.state.failed_items,
                        },
                    )
                    .await;
                }
            }
            RunCommand::Complete { status, error } => {
                if self.state.finish(status, error, now) {
                    self.persist().await;
                }
            }
        }
    }

    fn progress_milestone(&self) -> bool {
        let processed = self.state.processed_items;
        processed % self.inner.config.progress_notify_every == 0
            || processed >= self.state.total_items
    }

    async fn fail(&mut self, message: String) {
        if self
            .state
            .finish(OrchestrationStatus::Failed, Some(message), unix_now_ms())
        {
            self.persist().await;
        }
    }

    async fn persist(&mut self) {
        if self.lost_ownership {
            return;
        }
        match self.inner.store.compare_and_swap(&self.state).await {
            Ok(version) => self.state.version = version,
            Err(ReindexError::VersionConflict { .. }) => {
                self.lost_ownership = true;
                self.cancel.cancel();
                return;
            }
            // The in-memory version is unchanged, so the next write retries.
            Err(err) => warn!("Failed to persist reindex state {}: {err}", self.state.id),
        }
        self.state_tx.send_replace(self.state.clone());
    }

    async fn announce_outcome(&self) {
        let state = &self.state;
        let sink = &self.inner.sink;
        match state.status {
            OrchestrationStatus::Completed => {
                info!(
                    "Reindex {} completed. Processed: {}, Failed: {}",
                    state.id, state.processed_items, state.failed_items
                );
                deliver(
                    sink,
                    ReindexEvent::Completed {
                        id: state.id.clone(),
                        total: state.total_items,
                        processed: state.processed_items,
                        failed: state.failed_items,
                        success: state.failed_items == 0,
                    },
                )
                .await;
            }
            _ => {
                error!(
                    "Reindex {} failed. Processed: {}, Failed: {}, Errors: {}",
                    state.id,
                    state.processed_items,
                    state.failed_items,
                    state.recent_errors(3)
                );
                deliver(
                    sink,
                    ReindexEvent::Failed {
                        id: state.id.clone(),
                        error: state.recent_errors(3),
                    },
                )
                .await;
            }
        }

        if state.processed_items > state.failed_items {
            deliver(
                sink,
                ReindexEvent::ContentChanged {
                    id: state.id.clone(),
                    kind: state.target_kind,
                    key: state.target_key.clone(),
                },
            )
            .await;
        }
    }
}
