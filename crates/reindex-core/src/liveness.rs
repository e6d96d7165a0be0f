use crate::coordinator::RunCommand;
use crate::identity::OrchestrationId;
use crate::state::{unix_now_ms, OrchestrationState, OrchestrationStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Handle to a run owned by this process.
#[derive(Clone)]
pub(crate) struct LiveRun {
    pub run_seq: u64,
    pub commands: mpsc::Sender<RunCommand>,
    pub state: watch::Receiver<OrchestrationState>,
    pub cancel: CancellationToken,
}

impl LiveRun {
    /// The owner task drops its receiver when it exits, for any reason.
    fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Tells a record that says `Running` apart from a run that is actually
/// being driven.
///
/// The in-process handle registry is authoritative for runs this instance
/// owns. Records owned by another instance fall back to timestamp staleness.
pub struct LivenessTracker {
    owner_token: String,
    timeout: Duration,
    runs: Mutex<HashMap<OrchestrationId, LiveRun>>,
}

impl LivenessTracker {
    #[must_use]
    pub fn new(owner_token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            owner_token: owner_token.into(),
            timeout,
            runs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Whether `id` has a run in progress right now.
    #[must_use]
    pub fn is_active(&self, id: &OrchestrationId, record: Option<&OrchestrationState>) -> bool {
        if self.live(id).is_some() {
            return true;
        }
        let Some(record) = record else {
            return false;
        };
        if record.status != OrchestrationStatus::Running {
            return false;
        }
        match record.owner.as_deref() {
            // Ours, yet no live handle: the owning task is gone.
            Some(owner) if owner == self.owner_token => false,
            _ => !self.is_stale(record, unix_now_ms()),
        }
    }

    /// Timestamp check used for records owned by other instances.
    #[must_use]
    pub fn is_stale(&self, record: &OrchestrationState, now_ms: u64) -> bool {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_sub(record.last_updated_unix_ms) > timeout_ms
    }

    pub(crate) fn live(&self, id: &OrchestrationId) -> Option<LiveRun> {
        let mut guard = self.runs.lock().ok()?;
        match guard.get(id).map(LiveRun::is_alive) {
            Some(true) => guard.get(id).cloned(),
            Some(false) => {
                guard.remove(id);
                None
            }
            None => None,
        }
    }

    pub(crate) fn register(&self, id: OrchestrationId, run: LiveRun) {
        if let Ok(mut guard) = self.runs.lock() {
            guard.insert(id, run);
        }
    }

    /// Remove the handle for `run_seq`; a newer run's handle is left alone.
    pub(crate) fn deregister(&self, id: &OrchestrationId, run_seq: u64) {
        if let Ok(mut guard) = self.runs.lock() {
            if guard.get(id).is_some_and(|run| run.run_seq == run_seq) {
                guard.remove(id);
            }
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.runs
            .lock()
            .map(|guard| guard.values().filter(|run| run.is_alive()).count())
            .unwrap_or(0)
    }
}
