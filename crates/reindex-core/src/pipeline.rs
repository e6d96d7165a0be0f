//! Execution pipeline: enumerate a target's items and reindex each one with
//! bounded fan-out, pushing every outcome through the run's owner.
//!
//! ```text
//! list_items ──> set_totals
//!     │
//!     └──> for each item (≤ max_concurrency in flight)
//!             reindex_one (retried) ──> item report
//!                                          │
//!                         all done ──> complete(Completed)
//!                         cancelled ─> complete(Failed, "cancelled")
//! ```
//!
//! Item order of error entries is completion order, not enumeration order.

use crate::config::ReindexConfig;
use crate::coordinator::ProgressReporter;
use crate::state::{ItemOutcome, ItemReport, OrchestrationStatus, SYNTHETIC_CANCELLED};
use crate::target::{
    count_by_source, dedup_items, ItemReindexer, TargetCatalog, TargetDescriptor, WorkItem,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub(crate) struct PipelineContext {
    pub target: TargetDescriptor,
    pub catalog: Arc<dyn TargetCatalog>,
    pub reindexer: Arc<dyn ItemReindexer>,
    pub config: ReindexConfig,
    pub reporter: ProgressReporter,
    pub cancel: CancellationToken,
}

pub(crate) async fn execute(ctx: PipelineContext) {
    let PipelineContext {
        target,
        catalog,
        reindexer,
        config,
        reporter,
        cancel,
    } = ctx;

    let items = match catalog.list_items(&target).await {
        Ok(items) => items,
        Err(err) => {
            error!(
                "Failed to enumerate items for {} '{}': {err:#}",
                target.kind, target.key
            );
            reporter
                .complete(
                    OrchestrationStatus::Failed,
                    Some(format!("failed to enumerate items: {err:#}")),
                )
                .await;
            return;
        }
    };

    let (items, dropped) = dedup_items(items);
    if dropped > 0 {
        warn!(
            "Ignoring {dropped} repeated item id(s) listed for {} '{}'",
            target.kind, target.key
        );
    }

    info!(
        "Found {} items to reindex for {} '{}'",
        items.len(),
        target.kind,
        target.key
    );
    reporter
        .set_totals(items.len() as u64, count_by_source(&items))
        .await;

    let target = Arc::new(target);
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let mut in_flight = JoinSet::new();

    for item in items {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let item_target = target.clone();
        let reindexer = reindexer.clone();
        let reporter = reporter.clone();
        let cancel = cancel.clone();
        let config = config.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let outcome =
                reindex_with_retries(&reindexer, &item_target, &item, &config, &cancel).await;
            reporter
                .item(ItemReport {
                    item: item.id,
                    source: item.source,
                    outcome,
                })
                .await;
        });

        while let Some(done) = in_flight.try_join_next() {
            if let Err(err) = done {
                error!("Item worker for '{}' aborted: {err}", target.key);
            }
        }
    }

    while let Some(done) = in_flight.join_next().await {
        if let Err(err) = done {
            error!("Item worker for '{}' aborted: {err}", target.key);
        }
    }

    if cancel.is_cancelled() {
        info!("Reindex of {} '{}' cancelled", target.kind, target.key);
        reporter
            .complete(
                OrchestrationStatus::Failed,
                Some(SYNTHETIC_CANCELLED.to_string()),
            )
            .await;
    } else {
        reporter.complete(OrchestrationStatus::Completed, None).await;
    }
}

async fn reindex_with_retries(
    reindexer: &Arc<dyn ItemReindexer>,
    target: &Arc<TargetDescriptor>,
    item: &WorkItem,
    config: &ReindexConfig,
    cancel: &CancellationToken,
) -> ItemOutcome {
    let mut attempt = 1;
    loop {
        // Each attempt runs on its own task so a panicking reindexer turns
        // into an item failure instead of taking the worker down.
        let attempt_result = {
            let reindexer = reindexer.clone();
            let target = target.clone();
            let item = item.clone();
            tokio::spawn(async move { reindexer.reindex_one(&target, &item).await }).await
        };

        let message = match attempt_result {
            Ok(Ok(())) => {
                debug!("Reindexed item {} (attempt {attempt})", item.id);
                return ItemOutcome::Succeeded;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(join) if join.is_panic() => "reindex step panicked".to_string(),
            Err(join) => format!("reindex step aborted: {join}"),
        };

        if attempt >= config.item_max_attempts || cancel.is_cancelled() {
            debug!("Item {} failed after {attempt} attempt(s): {message}", item.id);
            return ItemOutcome::Failed(message);
        }
        debug!("Item {} attempt {attempt} failed, retrying: {message}", item.id);
        attempt += 1;
        tokio::select! {
            () = cancel.cancelled() => return ItemOutcome::Failed(message),
            () = tokio::time::sleep(config.retry_backoff()) => {}
        }
    }
}
