use crate::identity::TargetKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A resolved reindex target as reported by the host's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub kind: TargetKind,
    pub key: String,
    /// Indexing backend the target uses; hosts decide which ones are eligible.
    pub backend: String,
    /// Name of the search index the target's items land in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
}

/// One unit of reindex work: a document, or one content reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Storage source the item came from, for per-source progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Item counts grouped by source label (empty label for items without one).
#[must_use]
pub fn count_by_source(items: &[WorkItem]) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for item in items {
        *out.entry(item.source.clone().unwrap_or_default()).or_insert(0) += 1;
    }
    out
}

/// Drop repeated item ids, keeping the first occurrence. Progress is tracked
/// per item id, so a repeat would be counted in the totals but never
/// processed. Returns the kept items and the number dropped.
#[must_use]
pub(crate) fn dedup_items(items: Vec<WorkItem>) -> (Vec<WorkItem>, usize) {
    let before = items.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<WorkItem> = items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Target lookup, eligibility and enumeration, provided by the host.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    /// `Ok(None)` when no such target exists.
    async fn resolve_target(
        &self,
        kind: TargetKind,
        key: &str,
    ) -> anyhow::Result<Option<TargetDescriptor>>;

    /// `Err(detail)` explains why the target cannot be reindexed.
    fn check_eligible(&self, target: &TargetDescriptor) -> std::result::Result<(), String>;

    fn supports_reindexing(&self, target: &TargetDescriptor) -> bool {
        self.check_eligible(target).is_ok()
    }

    /// Items to reindex. Failing here fails the whole run.
    ///
    /// Item ids identify items within a run and should be unique across all
    /// sources; repeats are dropped (first occurrence wins) with a warning.
    async fn list_items(&self, target: &TargetDescriptor) -> anyhow::Result<Vec<WorkItem>>;
}

/// The per-item reindex step. The engine knows nothing about what it does.
#[async_trait]
pub trait ItemReindexer: Send + Sync {
    async fn reindex_one(&self, target: &TargetDescriptor, item: &WorkItem) -> anyhow::Result<()>;
}
