use crate::broadcast::StateBroadcaster;
use crate::config::PipelineConfig;
use crate::confirm::ConfirmationReporter;
use crate::gap::GapResolver;
use crate::lifecycle::{BatchLifecycle, BatchPhase, PhaseEvent};
use courier_core::{
    Cursor, CursorStore, DeviceInfo, GatewayError, HandlerRegistry, NotificationMessage,
    NotificationReport, ProcessingOutcome, ProcessingState, RemoteReportGateway, SequenceError,
    Skippability, StoreError,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How many consecutive handler failures each class of message tolerates
/// before the cursor is moved past it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub skippable_retry_limit: u32,
    /// `None` means the message is retried forever.
    pub non_skippable_retry_limit: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            skippable_retry_limit: crate::config::DEFAULT_SKIPPABLE_RETRY_LIMIT,
            non_skippable_retry_limit: None,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            skippable_retry_limit: config.skippable_retry_limit,
            non_skippable_retry_limit: config.non_skippable_retry_limit,
        }
    }

    pub fn limit_for(&self, skippability: Skippability) -> Option<u32> {
        match skippability {
            Skippability::Skippable => Some(self.skippable_retry_limit),
            Skippability::NonSkippable => self.non_skippable_retry_limit,
        }
    }

    /// `failures` already includes the attempt that just failed.
    pub fn should_skip(&self, skippability: Skippability, failures: u64) -> bool {
        self.limit_for(skippability).is_some_and(|limit| failures > u64::from(limit))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    CaughtUp,
    /// A failing message kept the cursor in place; retried on the next run.
    Stalled { id: i64, failures: u64 },
    Corruption(SequenceError),
    FetchFailed(GatewayError),
    Store(StoreError),
    /// A fetched page did not move the cursor although the server claims
    /// more messages exist.
    NoProgress { last_processed_id: i64, maximum_id: i64 },
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaughtUp => "caught_up",
            Self::Stalled { .. } => "stalled",
            Self::Corruption(_) => "corruption",
            Self::FetchFailed(_) => "fetch_failed",
            Self::Store(_) => "store",
            Self::NoProgress { .. } => "no_progress",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaughtUp => f.write_str("caught up"),
            Self::Stalled { id, failures } => {
                write!(f, "stalled on {id} after {failures} failures")
            }
            Self::Corruption(err) => write!(f, "aborted: {err}"),
            Self::FetchFailed(err) => write!(f, "fetch failed: {err}"),
            Self::Store(err) => write!(f, "cursor store failed: {err}"),
            Self::NoProgress { last_processed_id, maximum_id } => {
                write!(f, "no progress at {last_processed_id} toward {maximum_id}")
            }
        }
    }
}

/// Result of one processing run (one dequeued report plus its repair fetches).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<(i64, ProcessingOutcome)>,
    pub stop: StopReason,
    pub last_id_before: i64,
    pub last_id_after: i64,
    pub batches: u32,
    pub reports_fetched: u32,
    pub gap_refetched: bool,
}

impl RunSummary {
    fn starting_at(last_processed_id: i64) -> Self {
        Self {
            outcomes: Vec::new(),
            stop: StopReason::CaughtUp,
            last_id_before: last_processed_id,
            last_id_after: last_processed_id,
            batches: 0,
            reports_fetched: 0,
            gap_refetched: false,
        }
    }

    pub fn advanced(&self) -> bool {
        self.last_id_after > self.last_id_before
    }

    pub fn count(&self, outcome: ProcessingOutcome) -> usize {
        self.outcomes.iter().filter(|(_, seen)| *seen == outcome).count()
    }

    pub fn ids_with(&self, outcome: ProcessingOutcome) -> Vec<i64> {
        self.outcomes.iter().filter(|(_, seen)| *seen == outcome).map(|(id, _)| *id).collect()
    }
}

/// Single consumer of the ingestion queue and sole writer of the cursor.
pub struct SequentialProcessor {
    store: Arc<dyn CursorStore>,
    resolver: GapResolver,
    registry: Arc<HandlerRegistry>,
    device: Arc<dyn DeviceInfo>,
    policy: RetryPolicy,
    states: StateBroadcaster,
    confirmations: ConfirmationReporter,
    lifecycle: BatchLifecycle,
}

impl SequentialProcessor {
    pub fn new(
        store: Arc<dyn CursorStore>,
        gateway: Arc<dyn RemoteReportGateway>,
        registry: Arc<HandlerRegistry>,
        device: Arc<dyn DeviceInfo>,
        states: StateBroadcaster,
        confirmations: ConfirmationReporter,
    ) -> Self {
        Self {
            store,
            resolver: GapResolver::new(gateway),
            registry,
            device,
            policy: RetryPolicy::default(),
            states,
            confirmations,
            lifecycle: BatchLifecycle::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn phase(&self) -> BatchPhase {
        self.lifecycle.phase()
    }

    pub fn batches_started(&self) -> u64 {
        self.lifecycle.batches_started()
    }

    /// Processes `submitted`, then keeps fetching from the cursor until the
    /// highest id the server reported is reached or the run has to stop.
    pub fn run(&mut self, submitted: NotificationReport) -> RunSummary {
        let mut cursor = match self.store.load() {
            Ok(cursor) => cursor,
            Err(err) => {
                log::error!(target: "courier::processor", "cursor load failed: {err}");
                let mut summary = RunSummary::starting_at(0);
                summary.stop = StopReason::Store(err);
                return summary;
            }
        };
        let mut summary = RunSummary::starting_at(cursor.last_processed_id);
        self.enter(PhaseEvent::Drain);

        let resolved = match self.resolver.resolve(submitted, &cursor) {
            Ok(resolved) => resolved,
            Err(err) => {
                summary.stop = StopReason::FetchFailed(err);
                return self.finish_run(summary, &cursor);
            }
        };
        if resolved.refetched {
            summary.gap_refetched = true;
            summary.reports_fetched += 1;
        }
        let mut target = resolved.submitted_maximum_id;
        let mut report = resolved.report;
        let mut fetched = resolved.refetched;

        loop {
            target = target.max(report.maximum_id);
            let before_batch = cursor.last_processed_id;
            if let Err(reason) = self.process_batch(&report, &mut cursor, &mut summary) {
                summary.stop = reason;
                break;
            }
            if cursor.last_processed_id >= target {
                summary.stop = StopReason::CaughtUp;
                break;
            }
            if fetched && cursor.last_processed_id == before_batch {
                log::warn!(
                    target: "courier::gap",
                    "fetched page made no progress at {before_batch} toward {target}, ending run"
                );
                summary.stop = StopReason::NoProgress {
                    last_processed_id: before_batch,
                    maximum_id: target,
                };
                break;
            }

            self.enter(PhaseEvent::Drain);
            report = match self.resolver.fetch_from(cursor.last_processed_id) {
                Ok(report) => report,
                Err(err) => {
                    summary.stop = StopReason::FetchFailed(err);
                    break;
                }
            };
            summary.reports_fetched += 1;
            fetched = true;
        }

        self.finish_run(summary, &cursor)
    }

    fn finish_run(&mut self, mut summary: RunSummary, cursor: &Cursor) -> RunSummary {
        self.enter(PhaseEvent::Finish);
        summary.last_id_after = cursor.last_processed_id;
        log::debug!(
            target: "courier::processor",
            "run finished {} -> {} ({})",
            summary.last_id_before,
            summary.last_id_after,
            summary.stop
        );
        summary
    }

    fn process_batch(
        &mut self,
        report: &NotificationReport,
        cursor: &mut Cursor,
        summary: &mut RunSummary,
    ) -> Result<(), StopReason> {
        let before = cursor.last_processed_id;
        log::info!(
            target: "courier::processor",
            "processing list {:?}",
            report.messages.iter().map(|m| m.id).collect::<Vec<_>>()
        );
        summary.batches += 1;
        self.states.emit(ProcessingState::Started);

        let result = self.dispatch_all(report, cursor, summary);

        if cursor.last_processed_id > before {
            self.confirmations.report(cursor.last_processed_id);
        }
        self.states.emit(ProcessingState::Completed);
        result
    }

    fn dispatch_all(
        &mut self,
        report: &NotificationReport,
        cursor: &mut Cursor,
        summary: &mut RunSummary,
    ) -> Result<(), StopReason> {
        for message in &report.messages {
            self.enter(PhaseEvent::Dispatch);
            if message.id <= cursor.last_processed_id {
                summary.outcomes.push((message.id, ProcessingOutcome::AlreadyProcessed));
                continue;
            }
            if message.previous_id != cursor.last_processed_id {
                let err = SequenceError::Corruption {
                    id: message.id,
                    expected_previous: cursor.last_processed_id,
                    actual_previous: message.previous_id,
                };
                log::error!(target: "courier::processor", "bug detected, aborting run: {err}");
                return Err(StopReason::Corruption(err));
            }
            let outcome = self.apply(message, cursor)?;
            summary.outcomes.push((message.id, outcome));
        }
        Ok(())
    }

    fn apply(
        &mut self,
        message: &NotificationMessage,
        cursor: &mut Cursor,
    ) -> Result<ProcessingOutcome, StopReason> {
        log::info!(
            target: "courier::processor",
            "processing ({}) {} - {}",
            message.id,
            message.message_type,
            self.device.standby_bucket()
        );

        let retry = cursor.processing_failures;
        let err = match self.registry.dispatch(message, retry) {
            Ok(()) => {
                self.persist(cursor.advanced_to(message.id), cursor)?;
                return Ok(ProcessingOutcome::Applied);
            }
            Err(err) => err,
        };

        let failed = cursor.with_failure();
        let skippability = self.registry.skippability(&message.kind());
        log::warn!(
            target: "courier::processor",
            "error: ({}) {} - {} - {err}",
            message.id,
            message.message_type,
            failed.processing_failures
        );

        if self.policy.should_skip(skippability, failed.processing_failures) {
            log::error!(
                target: "courier::processor",
                "skipping ({}) {} after {} failures: {err}",
                message.id,
                message.message_type,
                failed.processing_failures
            );
            self.persist(failed.advanced_to(message.id), cursor)?;
            return Ok(ProcessingOutcome::SkippedAfterRetryLimit);
        }

        self.persist(failed, cursor)?;
        log::warn!(
            target: "courier::processor",
            "holding cursor at {} until ({}) {} succeeds",
            cursor.last_processed_id,
            message.id,
            message.message_type
        );
        Err(StopReason::Stalled { id: message.id, failures: failed.processing_failures })
    }

    fn persist(&mut self, next: Cursor, cursor: &mut Cursor) -> Result<(), StopReason> {
        self.enter(PhaseEvent::Advance);
        self.store.save(&next).map_err(|err| {
            log::error!(target: "courier::processor", "persisting cursor failed: {err}");
            StopReason::Store(err)
        })?;
        *cursor = next;
        Ok(())
    }

    fn enter(&mut self, event: PhaseEvent) {
        if let Err(err) = self.lifecycle.apply(event) {
            log::error!(target: "courier::processor", "{err}");
        }
    }
}
