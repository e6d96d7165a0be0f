//! # Reindex Core
//!
//! Single-flight orchestration of long-running reindex jobs.
//!
//! ## Flow
//!
//! ```text
//! start(kind, key, reason)
//!     │
//!     ├──> Identity resolver ("library-{name}", "process-{name}", "cr-reindex-{type}")
//!     │
//!     ├──> Target catalog (exists? eligible?)
//!     │
//!     └──> Coordinator
//!            ├─> live run for identity? ──> attach
//!            └─> new run (CAS into state store)
//!                   └─> Pipeline: enumerate ──> reindex items (bounded) ──> report
//!                                                                             │
//!                               Owner task applies reports, persists, notifies
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use reindex_core::{
//!     LogSink, MemoryStateStore, ReindexConfig, ReindexCoordinator, ReindexService,
//! };
//! use std::sync::Arc;
//! # use reindex_core::{ItemReindexer, TargetCatalog};
//! # async fn host(catalog: Arc<dyn TargetCatalog>, reindexer: Arc<dyn ItemReindexer>) -> anyhow::Result<()> {
//! let coordinator = ReindexCoordinator::new(
//!     Arc::new(MemoryStateStore::new()),
//!     catalog,
//!     reindexer,
//!     Arc::new(LogSink),
//!     ReindexConfig::default(),
//! );
//! let service = ReindexService::new(coordinator);
//!
//! let accepted = service.start_document_library("contracts", None).await?;
//! let state = service.get_state(accepted.orchestration_id.as_str()).await?;
//! println!("{:?}: {}/{}", state.status, state.processed_items, state.total_items);
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod file_store;
mod identity;
mod liveness;
mod notify;
mod pipeline;
mod service;
mod state;
mod store;
mod target;

pub use config::{ReindexConfig, DEFAULT_REASON};
pub use coordinator::{AttachResult, ReindexCoordinator};
pub use error::{ReindexError, Result};
pub use file_store::JsonFileStateStore;
pub use identity::{OrchestrationId, TargetKind};
pub use liveness::LivenessTracker;
pub use notify::{LogSink, NoopSink, NotificationSink, ReindexEvent};
pub use service::{ReindexService, StartResponse};
pub use state::{
    Applied, ErrorEntry, ItemLedger, ItemOutcome, ItemReport, OrchestrationState,
    OrchestrationStatus, SourceProgress, SYNTHETIC_CANCELLED,
};
pub use store::{MemoryStateStore, StateStore};
pub use target::{count_by_source, ItemReindexer, TargetCatalog, TargetDescriptor, WorkItem};
