use crate::coordinator::ReindexCoordinator;
use crate::identity::{OrchestrationId, TargetKind};
use crate::state::OrchestrationState;
use crate::{ReindexError, Result};
use log::{info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Answer to an accepted start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResponse {
    pub orchestration_id: OrchestrationId,
    pub target_key: String,
    pub reason: String,
    pub already_running: bool,
}

/// Caller-facing surface: precondition checks, then hand-off to the
/// coordinator. Nothing here blocks on a run finishing.
#[derive(Clone)]
pub struct ReindexService {
    coordinator: ReindexCoordinator,
}

impl ReindexService {
    #[must_use]
    pub const fn new(coordinator: ReindexCoordinator) -> Self {
        Self { coordinator }
    }

    #[must_use]
    pub const fn coordinator(&self) -> &ReindexCoordinator {
        &self.coordinator
    }

    /// Start (or attach to) the run for `(kind, key)`.
    ///
    /// Unknown or ineligible targets are rejected before any record is
    /// written. A blank `reason` falls back to the configured default.
    pub async fn start(
        &self,
        kind: TargetKind,
        key: &str,
        reason: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> Result<StartResponse> {
        let id = OrchestrationId::resolve(kind, key)?;
        let key = id.target_key().to_string();

        let catalog = self.coordinator.catalog();
        let target = catalog
            .resolve_target(kind, &key)
            .await
            .map_err(|err| ReindexError::Other(format!("target lookup failed: {err:#}")))?
            .ok_or_else(|| ReindexError::TargetNotFound {
                kind,
                key: key.clone(),
            })?;
        if let Err(detail) = catalog.check_eligible(&target) {
            warn!("Rejecting reindex of {kind} '{key}': {detail}");
            return Err(ReindexError::NotEligible { kind, key, detail });
        }

        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(self.coordinator.config().default_reason.as_str())
            .to_string();

        let attached = self.coordinator.start(&id, target, &reason, cancel).await?;
        if attached.already_running {
            info!("Reindex {id} requested again; already in progress");
        }
        Ok(StartResponse {
            orchestration_id: attached.id,
            target_key: key,
            reason: attached.reason,
            already_running: attached.already_running,
        })
    }

    pub async fn start_document_library(
        &self,
        short_name: &str,
        reason: Option<&str>,
    ) -> Result<StartResponse> {
        self.start(TargetKind::DocumentLibrary, short_name, reason, None)
            .await
    }

    pub async fn start_document_process(
        &self,
        short_name: &str,
        reason: Option<&str>,
    ) -> Result<StartResponse> {
        self.start(TargetKind::DocumentProcess, short_name, reason, None)
            .await
    }

    pub async fn start_content_reference_type(
        &self,
        reference_type: &str,
        reason: Option<&str>,
    ) -> Result<StartResponse> {
        self.start(TargetKind::ContentReferenceType, reference_type, reason, None)
            .await
    }

    /// State for a raw identity string, e.g. one returned by a start call.
    pub async fn get_state(&self, raw_id: &str) -> Result<OrchestrationState> {
        let id = OrchestrationId::parse(raw_id)
            .map_err(|_| ReindexError::UnknownIdentity(raw_id.to_string()))?;
        self.coordinator.get_state(&id).await
    }

    pub async fn is_running(&self, raw_id: &str) -> Result<bool> {
        let id = OrchestrationId::parse(raw_id)
            .map_err(|_| ReindexError::UnknownIdentity(raw_id.to_string()))?;
        self.coordinator.is_running(&id).await
    }

    pub async fn list(&self) -> Result<Vec<OrchestrationState>> {
        self.coordinator.list().await
    }
}
