#![allow(dead_code)]

use async_trait::async_trait;
use reindex_core::{
    ItemReindexer, MemoryStateStore, NotificationSink, OrchestrationId, OrchestrationState,
    OrchestrationStatus, ReindexConfig, ReindexCoordinator, ReindexEvent, ReindexService,
    StateStore, TargetCatalog, TargetDescriptor, TargetKind, WorkItem,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ELIGIBLE_BACKEND: &str = "vector_store";

/// In-memory catalog of targets and their items.
#[derive(Default)]
pub struct StaticCatalog {
    targets: HashMap<(TargetKind, String), (TargetDescriptor, Vec<WorkItem>)>,
    broken_listing: HashSet<String>,
    list_calls: AtomicUsize,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, kind: TargetKind, key: &str, items: usize) -> Self {
        let items = (1..=items)
            .map(|i| {
                let source = if i % 2 == 0 { "blob" } else { "sharepoint" };
                WorkItem::new(format!("doc-{i}")).with_source(source)
            })
            .collect();
        self.insert(kind, key, ELIGIBLE_BACKEND, items);
        self
    }

    pub fn with_items(mut self, kind: TargetKind, key: &str, items: Vec<WorkItem>) -> Self {
        self.insert(kind, key, ELIGIBLE_BACKEND, items);
        self
    }

    pub fn with_backend(mut self, kind: TargetKind, key: &str, backend: &str) -> Self {
        self.insert(kind, key, backend, vec![WorkItem::new("doc-1")]);
        self
    }

    pub fn with_broken_listing(mut self, kind: TargetKind, key: &str) -> Self {
        self.insert(kind, key, ELIGIBLE_BACKEND, Vec::new());
        self.broken_listing.insert(key.to_string());
        self
    }

    fn insert(&mut self, kind: TargetKind, key: &str, backend: &str, items: Vec<WorkItem>) {
        let descriptor = TargetDescriptor {
            kind,
            key: key.to_string(),
            backend: backend.to_string(),
            index_name: Some(format!("index-{key}")),
        };
        self.targets.insert((kind, key.to_string()), (descriptor, items));
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetCatalog for StaticCatalog {
    async fn resolve_target(
        &self,
        kind: TargetKind,
        key: &str,
    ) -> anyhow::Result<Option<TargetDescriptor>> {
        Ok(self
            .targets
            .get(&(kind, key.to_string()))
            .map(|(descriptor, _)| descriptor.clone()))
    }

    fn check_eligible(&self, target: &TargetDescriptor) -> Result<(), String> {
        if target.backend == ELIGIBLE_BACKEND {
            Ok(())
        } else {
            Err(format!("backend '{}' cannot be reindexed", target.backend))
        }
    }

    async fn list_items(&self, target: &TargetDescriptor) -> anyhow::Result<Vec<WorkItem>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_listing.contains(&target.key) {
            anyhow::bail!("storage backend unreachable");
        }
        Ok(self
            .targets
            .get(&(target.kind, target.key.clone()))
            .map(|(_, items)| items.clone())
            .unwrap_or_default())
    }
}

/// Reindexer whose per-item behaviour is scripted by item id.
#[derive(Default)]
pub struct ScriptedReindexer {
    failing: HashSet<String>,
    panicking: HashSet<String>,
    flaky: HashSet<String>,
    delay: Duration,
    calls: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedReindexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, items: &[&str]) -> Self {
        self.failing.extend(items.iter().map(|s| s.to_string()));
        self
    }

    pub fn panicking(mut self, items: &[&str]) -> Self {
        self.panicking.extend(items.iter().map(|s| s.to_string()));
        self
    }

    /// Fails the first attempt only.
    pub fn flaky(mut self, items: &[&str]) -> Self {
        self.flaky.extend(items.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemReindexer for ScriptedReindexer {
    async fn reindex_one(&self, _target: &TargetDescriptor, item: &WorkItem) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(item.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panicking.contains(&item.id) {
            panic!("reindexer blew up on {}", item.id);
        }
        if self.failing.contains(&item.id) {
            anyhow::bail!("embedding service rejected {}", item.id);
        }
        if self.flaky.contains(&item.id) && attempt == 1 {
            anyhow::bail!("transient timeout");
        }
        Ok(())
    }
}

/// Sink that records every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ReindexEvent>>,
    reject_all: bool,
    panic_on_progress: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject_all: true,
            ..Self::default()
        }
    }

    pub fn panicking_on_progress() -> Self {
        Self {
            panic_on_progress: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ReindexEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until `pred` holds on the recorded events.
    pub async fn wait_until(&self, pred: impl Fn(&[ReindexEvent]) -> bool) -> Vec<ReindexEvent> {
        for _ in 0..500 {
            let events = self.events();
            if pred(&events) {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected events never arrived: {:?}", self.events());
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, event: ReindexEvent) -> anyhow::Result<()> {
        let is_progress = matches!(event, ReindexEvent::Progress { .. });
        self.events.lock().unwrap().push(event);
        if self.panic_on_progress && is_progress {
            panic!("progress consumer crashed");
        }
        if self.reject_all {
            anyhow::bail!("notification endpoint offline");
        }
        Ok(())
    }
}

/// Memory store whose first write of a running record with at least
/// `panic_at` processed items panics, as a broken backend would.
pub struct PanickingStore {
    inner: Arc<MemoryStateStore>,
    panic_at: u64,
    tripped: AtomicBool,
}

impl PanickingStore {
    pub fn new(inner: Arc<MemoryStateStore>, panic_at: u64) -> Self {
        Self {
            inner,
            panic_at,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StateStore for PanickingStore {
    async fn load(&self, id: &OrchestrationId) -> reindex_core::Result<Option<OrchestrationState>> {
        self.inner.load(id).await
    }

    async fn compare_and_swap(&self, record: &OrchestrationState) -> reindex_core::Result<u64> {
        if record.status == OrchestrationStatus::Running
            && record.processed_items >= self.panic_at
            && !self.tripped.swap(true, Ordering::SeqCst)
        {
            panic!("state backend corrupted while writing {}", record.id);
        }
        self.inner.compare_and_swap(record).await
    }

    async fn list(&self) -> reindex_core::Result<Vec<OrchestrationState>> {
        self.inner.list().await
    }
}

pub fn fast_config() -> ReindexConfig {
    ReindexConfig {
        max_concurrency: 4,
        retry_backoff_ms: 1,
        item_max_attempts: 2,
        ..ReindexConfig::default()
    }
}

pub struct Harness {
    pub catalog: Arc<StaticCatalog>,
    pub reindexer: Arc<ScriptedReindexer>,
    pub sink: Arc<RecordingSink>,
    pub service: ReindexService,
}

impl Harness {
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: StaticCatalog,
        reindexer: ScriptedReindexer,
        config: ReindexConfig,
    ) -> Self {
        Self::with_sink(store, catalog, reindexer, RecordingSink::new(), config)
    }

    pub fn with_sink(
        store: Arc<dyn StateStore>,
        catalog: StaticCatalog,
        reindexer: ScriptedReindexer,
        sink: RecordingSink,
        config: ReindexConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let reindexer = Arc::new(reindexer);
        let sink = Arc::new(sink);
        let coordinator = ReindexCoordinator::new(
            store,
            catalog.clone(),
            reindexer.clone(),
            sink.clone(),
            config,
        );
        Self {
            catalog,
            reindexer,
            sink,
            service: ReindexService::new(coordinator),
        }
    }

    pub fn coordinator(&self) -> &ReindexCoordinator {
        self.service.coordinator()
    }

    pub async fn run_to_end(&self, raw_id: &str) -> OrchestrationState {
        let id: OrchestrationId = raw_id.parse().expect("valid orchestration id");
        let state = tokio::time::timeout(Duration::from_secs(10), self.coordinator().wait(&id))
            .await
            .expect("run finished in time")
            .expect("final state");
        // The owner deregisters just after publishing the terminal state.
        self.until_idle().await;
        state
    }

    /// Poll until no run is live in this coordinator.
    pub async fn until_idle(&self) {
        for _ in 0..1000 {
            if self.coordinator().liveness().live_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("runs still live after 5s");
    }

    /// Poll `get_state` until `pred` holds.
    pub async fn state_when(
        &self,
        raw_id: &str,
        pred: impl Fn(&OrchestrationState) -> bool,
    ) -> OrchestrationState {
        for _ in 0..1000 {
            let state = self.service.get_state(raw_id).await.expect("state");
            if pred(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{raw_id} never reached the expected state");
    }
}
