//! In-order delivery of server notifications: ingestion queue, gap repair,
//! sequential processing with retry/skip, delivery confirmation and the
//! supervised runtime that ties them together.

pub mod broadcast;
pub mod config;
pub mod confirm;
pub mod gap;
pub mod lifecycle;
pub mod poller;
pub mod processor;
pub mod queue;
pub mod runtime;

pub use broadcast::StateBroadcaster;
pub use config::{LoggingConfig, PipelineConfig};
pub use confirm::{ConfirmationReporter, ConfirmationSnapshot, ConfirmationWorker};
pub use gap::{detect_gap, GapReason, GapResolver, ResolvedReport};
pub use lifecycle::{BatchLifecycle, BatchPhase, PhaseError, PhaseEvent};
pub use poller::{Poller, PollerExit, PollerHandle};
pub use processor::{RetryPolicy, RunSummary, SequentialProcessor, StopReason};
pub use queue::{IngestionQueue, PendingReports, SubmitOutcome};
pub use runtime::{NotificationPipeline, PipelineDeps, PipelineStatus};
