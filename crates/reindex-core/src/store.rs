use crate::identity::OrchestrationId;
use crate::state::OrchestrationState;
use crate::{ReindexError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable home of orchestration records, one per identity.
///
/// Writers never blindly overwrite: `compare_and_swap` succeeds only when the
/// stored version still equals `record.version` (absent records count as
/// version 0), and returns the newly assigned version.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, id: &OrchestrationId) -> Result<Option<OrchestrationState>>;

    async fn compare_and_swap(&self, record: &OrchestrationState) -> Result<u64>;

    async fn list(&self) -> Result<Vec<OrchestrationState>>;
}

/// Process-local store. Survives coordinator restarts within one process.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<OrchestrationId, OrchestrationState>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, bypassing version checks.
    pub fn insert_raw(&self, record: OrchestrationState) {
        if let Ok(mut guard) = self.records.lock() {
            guard.insert(record.id.clone(), record);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, id: &OrchestrationId) -> Result<Option<OrchestrationState>> {
        let guard = self
            .records
            .lock()
            .map_err(|_| ReindexError::Other("state store lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn compare_and_swap(&self, record: &OrchestrationState) -> Result<u64> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| ReindexError::Other("state store lock poisoned".to_string()))?;
        let current = guard.get(&record.id).map_or(0, |r| r.version);
        if current != record.version {
            return Err(ReindexError::VersionConflict {
                id: record.id.to_string(),
            });
        }
        let mut stored = record.clone();
        stored.version = current + 1;
        guard.insert(stored.id.clone(), stored);
        Ok(current + 1)
    }

    async fn list(&self) -> Result<Vec<OrchestrationState>> {
        let guard = self
            .records
            .lock()
            .map_err(|_| ReindexError::Other("state store lock poisoned".to_string()))?;
        let mut out: Vec<_> = guard.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
