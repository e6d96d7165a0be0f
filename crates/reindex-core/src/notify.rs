use crate::identity::{OrchestrationId, TargetKind};
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReindexEvent {
    Started {
        id: OrchestrationId,
        kind: TargetKind,
        key: String,
        reason: String,
    },
    Progress {
        id: OrchestrationId,
        total: u64,
        processed: u64,
        failed: u64,
    },
    Completed {
        id: OrchestrationId,
        total: u64,
        processed: u64,
        failed: u64,
        success: bool,
    },
    Failed {
        id: OrchestrationId,
        error: String,
    },
    /// Indexed content of the target changed; dependent caches should refresh.
    ContentChanged {
        id: OrchestrationId,
        kind: TargetKind,
        key: String,
    },
}

impl ReindexEvent {
    #[must_use]
    pub const fn id(&self) -> &OrchestrationId {
        match self {
            Self::Started { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::ContentChanged { id, .. } => id,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: ReindexEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn notify(&self, _event: ReindexEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes every event to the log as a JSON line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: ReindexEvent) -> anyhow::Result<()> {
        info!("reindex event: {}", serde_json::to_string(&event)?);
        Ok(())
    }
}

/// Delivery never affects the run: errors and panics in the sink are logged
/// and dropped. Each call runs on its own task so a panic cannot unwind the
/// caller.
pub(crate) async fn deliver(sink: &Arc<dyn NotificationSink>, event: ReindexEvent) {
    let id = event.id().clone();
    let sink = sink.clone();
    match tokio::spawn(async move { sink.notify(event).await }).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Failed to deliver reindex notification for {id}: {err}"),
        Err(join) if join.is_panic() => {
            warn!("Notification sink panicked while delivering for {id}");
        }
        Err(join) => warn!("Notification delivery for {id} aborted: {join}"),
    }
}
