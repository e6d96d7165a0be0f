use crate::identity::{OrchestrationId, TargetKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

pub const SYNTHETIC_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl OrchestrationStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One error recorded against a run. `item` is `None` for job-level
/// (synthetic) entries such as cancellation or an enumeration failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub message: String,
}

impl ErrorEntry {
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.item {
            Some(item) => format!("{item}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub last_updated_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OrchestrationState {
    pub id: OrchestrationId,
    pub target_kind: TargetKind,
    pub target_key: String,
    pub status: OrchestrationStatus,
    pub reason: String,
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceProgress>,
    pub started_at_unix_ms: u64,
    pub last_updated_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_unix_ms: Option<u64>,
    /// Owner token of the coordinator instance driving the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub run_seq: u64,
    #[serde(default)]
    pub version: u64,
}

impl OrchestrationState {
    /// Placeholder returned for identities that never started.
    #[must_use]
    pub fn not_started(id: &OrchestrationId) -> Self {
        Self {
            id: id.clone(),
            target_kind: id.target_kind(),
            target_key: id.target_key().to_string(),
            status: OrchestrationStatus::NotStarted,
            reason: String::new(),
            total_items: 0,
            processed_items: 0,
            failed_items: 0,
            errors: Vec::new(),
            sources: BTreeMap::new(),
            started_at_unix_ms: 0,
            last_updated_unix_ms: 0,
            completed_at_unix_ms: None,
            owner: None,
            run_seq: 0,
            version: 0,
        }
    }

    /// Fresh `Running` record for a new run, reusing the identity of `prior`
    /// (if any) but none of its counters or errors.
    #[must_use]
    pub fn begin_run(
        id: &OrchestrationId,
        reason: &str,
        owner: &str,
        prior: Option<&Self>,
        now_ms: u64,
    ) -> Self {
        let prior_started = prior.map_or(0, |p| p.started_at_unix_ms);
        // Runs under one identity must have strictly increasing start times.
        let started = now_ms.max(prior_started.saturating_add(1));
        Self {
            status: OrchestrationStatus::Running,
            reason: reason.to_string(),
            started_at_unix_ms: started,
            last_updated_unix_ms: started,
            owner: Some(owner.to_string()),
            run_seq: prior.map_or(0, |p| p.run_seq) + 1,
            version: prior.map_or(0, |p| p.version),
            ..Self::not_started(id)
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// JSON Schema of the record as stores persist it and hosts print it.
    pub fn json_schema() -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(schemars::schema_for!(Self))?)
    }

    #[must_use]
    pub fn item_error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.item.is_some()).count()
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_updated_unix_ms = self.last_updated_unix_ms.max(now_ms);
    }

    /// Record the enumeration result. Counters never move backwards.
    pub fn set_totals(&mut self, total: u64, per_source: &BTreeMap<String, u64>, now_ms: u64) {
        self.total_items = self.total_items.max(total);
        for (source, count) in per_source {
            let entry = self.sources.entry(source.clone()).or_default();
            entry.total = entry.total.max(*count);
            entry.last_updated_unix_ms = now_ms;
        }
        self.touch(now_ms);
    }

    /// Move the run to a terminal status. Returns `false` if it already was.
    pub fn finish(
        &mut self,
        status: OrchestrationStatus,
        synthetic_error: Option<String>,
        now_ms: u64,
    ) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        if let Some(message) = synthetic_error {
            self.errors.push(ErrorEntry {
                item: None,
                message,
            });
        }
        self.status = status;
        self.touch(now_ms);
        self.completed_at_unix_ms = Some(self.last_updated_unix_ms);
        true
    }

    /// Last `n` error descriptions joined for a failure summary.
    #[must_use]
    pub fn recent_errors(&self, n: usize) -> String {
        let skip = self.errors.len().saturating_sub(n);
        self.errors
            .iter()
            .skip(skip)
            .map(ErrorEntry::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item: String,
    pub source: Option<String>,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First report for this item; counters moved.
    Counted,
    /// Repeat failure; the existing error message was replaced.
    Overwrote,
    /// Repeat report with nothing to change.
    Ignored,
}

/// Per-run memory of which items have been reported, so a retried item is
/// never counted twice and never produces a second error entry.
#[derive(Debug, Default)]
pub struct ItemLedger {
    seen: HashMap<String, bool>,
}

impl ItemLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &mut self,
        state: &mut OrchestrationState,
        report: ItemReport,
        now_ms: u64,
    ) -> Applied {
        state.touch(now_ms);
        let source_key = report.source.clone().unwrap_or_default();

        match (self.seen.get(&report.item).copied(), report.outcome) {
            (None, outcome) => {
                let failed = matches!(outcome, ItemOutcome::Failed(_));
                self.seen.insert(report.item.clone(), failed);
                state.processed_items += 1;
                state.total_items = state.total_items.max(state.processed_items);
                let source = state.sources.entry(source_key).or_default();
                source.processed += 1;
                source.total = source.total.max(source.processed);
                source.last_updated_unix_ms = now_ms;
                if let ItemOutcome::Failed(message) = outcome {
                    state.failed_items += 1;
                    source.failed += 1;
                    state.errors.push(ErrorEntry {
                        item: Some(report.item),
                        message,
                    });
                }
                Applied::Counted
            }
            (Some(true), ItemOutcome::Failed(message)) => {
                if let Some(entry) = state
                    .errors
                    .iter_mut()
                    .find(|e| e.item.as_deref() == Some(report.item.as_str()))
                {
                    entry.message = message;
                }
                Applied::Overwrote
            }
            // A later success does not erase a recorded failure, and a later
            // failure of an item that already succeeded is not counted.
            (Some(_), _) => Applied::Ignored,
        }
    }
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id() -> OrchestrationId {
        OrchestrationId::resolve(TargetKind::DocumentLibrary, "contracts").unwrap()
    }

    fn report(item: &str, outcome: ItemOutcome) -> ItemReport {
        ItemReport {
            item: item.to_string(),
            source: Some("blob".to_string()),
            outcome,
        }
    }

    #[test]
    fn begin_run_resets_counters_and_bumps_start() {
        let mut prior = OrchestrationState::begin_run(&id(), "first", "a", None, 1_000);
        prior.processed_items = 5;
        prior.failed_items = 1;
        prior.errors.push(ErrorEntry {
            item: Some("x".into()),
            message: "boom".into(),
        });
        prior.finish(OrchestrationStatus::Completed, None, 1_000);
        prior.version = 7;

        let next = OrchestrationState::begin_run(&id(), "second", "b", Some(&prior), 1_000);
        assert_eq!(next.status, OrchestrationStatus::Running);
        assert_eq!(next.processed_items, 0);
        assert_eq!(next.failed_items, 0);
        assert!(next.errors.is_empty());
        assert!(next.completed_at_unix_ms.is_none());
        assert!(next.started_at_unix_ms > prior.started_at_unix_ms);
        assert_eq!(next.run_seq, 2);
        assert_eq!(next.version, 7);
        assert_eq!(next.reason, "second");
    }

    #[test]
    fn failure_then_retry_success_keeps_single_error() {
        let mut state = OrchestrationState::begin_run(&id(), "r", "a", None, 1);
        let mut ledger = ItemLedger::new();

        let first = ledger.apply(&mut state, report("doc-1", ItemOutcome::Failed("e1".into())), 2);
        let again = ledger.apply(&mut state, report("doc-1", ItemOutcome::Failed("e2".into())), 3);
        let ok = ledger.apply(&mut state, report("doc-1", ItemOutcome::Succeeded), 4);

        assert_eq!(first, Applied::Counted);
        assert_eq!(again, Applied::Overwrote);
        assert_eq!(ok, Applied::Ignored);
        assert_eq!(state.processed_items, 1);
        assert_eq!(state.failed_items, 1);
        assert_eq!(
            state.errors,
            vec![ErrorEntry {
                item: Some("doc-1".into()),
                message: "e2".into()
            }]
        );
        assert_eq!(state.sources["blob"].failed, 1);
        assert_eq!(state.last_updated_unix_ms, 4);
    }

    #[test]
    fn finish_sets_completion_once() {
        let mut state = OrchestrationState::begin_run(&id(), "r", "a", None, 10);
        assert!(!state.finish(OrchestrationStatus::Running, None, 11));
        assert!(state.finish(OrchestrationStatus::Failed, Some("cancelled".into()), 12));
        assert!(!state.finish(OrchestrationStatus::Completed, None, 13));
        assert_eq!(state.status, OrchestrationStatus::Failed);
        assert_eq!(state.completed_at_unix_ms, Some(12));
        assert_eq!(state.item_error_count(), 0);
        assert_eq!(state.recent_errors(3), "cancelled");
    }

    #[test]
    fn schema_describes_persisted_fields() {
        let schema = OrchestrationState::json_schema().unwrap();
        assert_eq!(schema["title"], "OrchestrationState");
        for field in ["id", "status", "processed_items", "errors", "sources", "version"] {
            assert!(schema["properties"][field].is_object(), "missing {field}");
        }
    }

    #[test]
    fn totals_never_shrink() {
        let mut state = OrchestrationState::begin_run(&id(), "r", "a", None, 1);
        let mut per_source = BTreeMap::new();
        per_source.insert("blob".to_string(), 4);
        state.set_totals(4, &per_source, 2);
        per_source.insert("blob".to_string(), 1);
        state.set_totals(1, &per_source, 3);
        assert_eq!(state.total_items, 4);
        assert_eq!(state.sources["blob"].total, 4);
    }
}
