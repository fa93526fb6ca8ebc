use crate::broadcast::StateBroadcaster;
use crate::config::PipelineConfig;
use crate::confirm::{ConfirmationReporter, ConfirmationStats, ConfirmationWorker};
use crate::poller::{Poller, PollerHandle};
use crate::processor::{RetryPolicy, RunSummary, SequentialProcessor};
use crate::queue::{IngestionQueue, SubmitOutcome};
use courier_core::{
    CourierError, Cursor, CursorStore, DeviceInfo, HandlerRegistry, NotificationReport,
    ProcessingState, RemoteReportGateway,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// External collaborators the pipeline is wired to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub gateway: Arc<dyn RemoteReportGateway>,
    pub store: Arc<dyn CursorStore>,
    pub registry: Arc<HandlerRegistry>,
    pub device: Arc<dyn DeviceInfo>,
}

impl PipelineDeps {
    pub fn new(
        gateway: impl RemoteReportGateway + 'static,
        store: impl CursorStore + 'static,
        registry: HandlerRegistry,
        device: impl DeviceInfo + 'static,
    ) -> Self {
        Self {
            gateway: Arc::new(gateway),
            store: Arc::new(store),
            registry: Arc::new(registry),
            device: Arc::new(device),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PipelineStatus {
    pub running: bool,
    pub cursor: Option<Cursor>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub submitted_reports: u64,
    pub dropped_reports: u64,
    pub runs_completed: u64,
    pub consumer_restarts: u64,
    pub confirmations_sent: u64,
    pub confirmations_failed: u64,
    pub last_confirmed_id: i64,
    pub pull_failures: u64,
    pub last_stop: Option<String>,
}

#[derive(Debug, Default)]
struct RuntimeStats {
    busy: AtomicBool,
    settled_reports: AtomicU64,
    runs_completed: AtomicU64,
    consumer_restarts: AtomicU64,
    pulls_in_flight: AtomicU64,
    pull_failures: AtomicU64,
    last_stop: Mutex<Option<String>>,
}

impl RuntimeStats {
    fn record(&self, summary: &RunSummary) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        let mut last_stop = self.last_stop.lock().unwrap_or_else(PoisonError::into_inner);
        *last_stop = Some(summary.stop.to_string());
    }
}

/// State shared between the handle and the tasks on the worker runtime.
struct Shared {
    config: PipelineConfig,
    deps: PipelineDeps,
    queue: IngestionQueue,
    states: StateBroadcaster,
    confirmations: ConfirmationReporter,
    confirmation_stats: Arc<ConfirmationStats>,
    stats: RuntimeStats,
}

impl Shared {
    fn processor(&self) -> SequentialProcessor {
        SequentialProcessor::new(
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.gateway),
            Arc::clone(&self.deps.registry),
            Arc::clone(&self.deps.device),
            self.states.clone(),
            self.confirmations.clone(),
        )
        .with_policy(RetryPolicy::from_config(&self.config))
    }

    fn is_idle(&self) -> bool {
        let settled = self.stats.settled_reports.load(Ordering::Acquire);
        let accounted = settled.saturating_add(self.queue.dropped());
        accounted >= self.queue.submitted()
            && !self.stats.busy.load(Ordering::Acquire)
            && self.stats.pulls_in_flight.load(Ordering::Acquire) == 0
            && self.confirmation_stats.pending() == 0
    }
}

/// Handle to a running notification pipeline.
///
/// The pipeline owns a dedicated worker thread with its own tokio runtime;
/// processing, gap fetches and confirmations never run on the caller's
/// thread. Clones share the same pipeline; dropping the last one shuts it
/// down.
#[derive(Clone)]
pub struct NotificationPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    shared: Arc<Shared>,
    runtime: tokio::runtime::Handle,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationPipeline {
    pub fn start(config: PipelineConfig, mut deps: PipelineDeps) -> Result<Self, CourierError> {
        config.validate()?;
        match Arc::get_mut(&mut deps.registry) {
            Some(registry) => config.classify(registry),
            None => log::warn!(
                target: "courier::runtime",
                "handler registry is shared, keeping its own skip classification"
            ),
        }

        let (reporter, confirm_rx) = ConfirmationReporter::channel();
        let shared = Arc::new(Shared {
            queue: IngestionQueue::new(config.max_pending),
            states: StateBroadcaster::default(),
            confirmation_stats: reporter.stats(),
            confirmations: reporter,
            stats: RuntimeStats::default(),
            config,
            deps,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (startup_tx, startup_rx) = std_mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("courier-pipeline".to_owned())
            .spawn(move || runtime_thread(worker_shared, confirm_rx, shutdown_rx, startup_tx))
            .map_err(|err| CourierError::Runtime(format!("failed to spawn pipeline worker: {err}")))?;

        let runtime = startup_rx
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|_| CourierError::Runtime("pipeline startup timed out".to_owned()))?
            .map_err(CourierError::Runtime)?;

        log::info!(
            target: "courier::runtime",
            "pipeline started (max_pending={})",
            shared.config.max_pending
        );
        Ok(Self {
            inner: Arc::new(PipelineInner {
                shared,
                runtime,
                shutdown_tx,
                running: AtomicBool::new(true),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), CourierError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CourierError::Stopped)
        }
    }

    /// Buffers `report` for the consumer. Never waits on processing.
    pub fn submit(&self, report: NotificationReport) -> Result<SubmitOutcome, CourierError> {
        self.ensure_running()?;
        Ok(self.inner.shared.queue.submit(report))
    }

    /// Fetches everything after the persisted cursor in the background and
    /// submits the result like any other producer.
    pub fn pull_now(&self) -> Result<(), CourierError> {
        self.ensure_running()?;
        let shared = Arc::clone(&self.inner.shared);
        shared.stats.pulls_in_flight.fetch_add(1, Ordering::AcqRel);
        self.inner.runtime.spawn(async move {
            if let Err(err) = pull_once(Arc::clone(&shared)).await {
                log::warn!(target: "courier::runtime", "pull failed: {err}");
            }
            shared.stats.pulls_in_flight.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    /// Starts periodic pulls at `poll_interval_ms`.
    pub fn start_poller(&self) -> Result<PollerHandle, CourierError> {
        self.ensure_running()?;
        let interval = self
            .inner
            .shared
            .config
            .poll_interval()
            .ok_or_else(|| CourierError::Config("polling is disabled (poll_interval_ms = 0)".into()))?;
        let shared = Arc::clone(&self.inner.shared);
        let pull = move || pull_once(Arc::clone(&shared));
        Ok(Poller::new(interval).spawn(&self.inner.runtime, pull, self.inner.shutdown_tx.subscribe()))
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<ProcessingState> {
        self.inner.shared.states.subscribe()
    }

    pub fn status(&self) -> PipelineStatus {
        let shared = &self.inner.shared;
        let confirmations = shared.confirmation_stats.snapshot();
        let cursor = match shared.deps.store.load() {
            Ok(cursor) => Some(cursor),
            Err(err) => {
                log::warn!(target: "courier::runtime", "status could not load cursor: {err}");
                None
            }
        };
        PipelineStatus {
            running: self.is_running(),
            cursor,
            queue_depth: shared.queue.len(),
            queue_capacity: shared.queue.capacity(),
            submitted_reports: shared.queue.submitted(),
            dropped_reports: shared.queue.dropped(),
            runs_completed: shared.stats.runs_completed.load(Ordering::Relaxed),
            consumer_restarts: shared.stats.consumer_restarts.load(Ordering::Relaxed),
            confirmations_sent: confirmations.sent,
            confirmations_failed: confirmations.failed,
            last_confirmed_id: confirmations.last_confirmed_id,
            pull_failures: shared.stats.pull_failures.load(Ordering::Relaxed),
            last_stop: shared.stats.last_stop.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    /// Blocks until every submitted report has been processed (or dropped)
    /// and no pull or confirmation is in flight. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.shared.is_idle() {
                return true;
            }
            if !self.is_running() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stops the consumer, confirmation worker and pollers and joins the
    /// worker thread. Buffered reports are discarded; the cursor makes them
    /// recoverable by the next pull.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl PipelineInner {
    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!(target: "courier::runtime", "pipeline worker panicked during shutdown");
            }
        }
        let discarded = self.shared.queue.clear();
        log::info!(
            target: "courier::runtime",
            "pipeline stopped ({discarded} buffered reports discarded)"
        );
    }
}

// Runs once, when the last handle clone goes away.
impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pull_once(shared: Arc<Shared>) -> Result<SubmitOutcome, CourierError> {
    let worker = Arc::clone(&shared);
    let fetched = tokio::task::spawn_blocking(move || -> Result<NotificationReport, CourierError> {
        let cursor = worker.deps.store.load()?;
        log::info!(
            target: "courier::runtime",
            "pulling after {}",
            cursor.last_processed_id
        );
        Ok(worker.deps.gateway.fetch_after(cursor.last_processed_id)?)
    })
    .await
    .map_err(|err| CourierError::Runtime(format!("pull task failed: {err}")))
    .and_then(|result| result);

    match fetched {
        Ok(report) => Ok(shared.queue.submit(report)),
        Err(err) => {
            shared.stats.pull_failures.fetch_add(1, Ordering::Relaxed);
            Err(err)
        }
    }
}

fn runtime_thread(
    shared: Arc<Shared>,
    confirm_rx: tokio::sync::mpsc::UnboundedReceiver<i64>,
    shutdown_rx: watch::Receiver<bool>,
    startup_tx: std_mpsc::Sender<Result<tokio::runtime::Handle, String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = startup_tx.send(Err(format!("failed to build tokio runtime: {err}")));
            return;
        }
    };

    runtime.block_on(async move {
        let confirmations = ConfirmationWorker::new(
            Arc::clone(&shared.deps.gateway),
            Arc::clone(&shared.deps.device),
            &shared.confirmations,
        );
        tokio::spawn(confirmations.run(confirm_rx, shutdown_rx.clone()));
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), shutdown_rx.clone()));

        let _ = startup_tx.send(Ok(tokio::runtime::Handle::current()));

        let mut shutdown = shutdown_rx;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        if supervisor.await.is_err() {
            log::error!(target: "courier::runtime", "supervisor ended abnormally");
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

/// Keeps exactly one consumer alive, restarting it after a crash.
async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let backoff = shared.config.supervisor_backoff();
    loop {
        let consumer = tokio::spawn(consume(Arc::clone(&shared), shutdown.clone()));
        match consumer.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                let restarts = shared.stats.consumer_restarts.fetch_add(1, Ordering::Relaxed) + 1;
                log::error!(
                    target: "courier::runtime",
                    "consumer crashed, restarting in {}ms (restart #{restarts})",
                    backoff.as_millis()
                );
            }
            Err(err) => {
                log::warn!(target: "courier::runtime", "consumer cancelled: {err}");
                break;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
    }
    log::debug!(target: "courier::runtime", "supervisor stopped");
}

/// Drains the queue one report at a time. Each run executes on the blocking
/// pool; a panic escaping it is re-raised so the supervisor sees it.
async fn consume(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut processor = shared.processor();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let report = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            report = shared.queue.next() => report,
        };

        shared.stats.busy.store(true, Ordering::Release);
        let outcome = tokio::task::spawn_blocking(move || {
            let summary = processor.run(report);
            (processor, summary)
        })
        .await;
        if let Ok((_, summary)) = &outcome {
            shared.stats.record(summary);
        }
        shared.stats.busy.store(false, Ordering::Release);
        shared.stats.settled_reports.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok((returned, _)) => processor = returned,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                log::warn!(target: "courier::runtime", "processing run cancelled: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{HandlerError, MemoryCursorStore, MessageKind, NotificationMessage};
    use test_support::{chain, device, report_of, ScriptedGateway};

    fn deps(gateway: ScriptedGateway) -> PipelineDeps {
        let mut registry = HandlerRegistry::new();
        registry.register(
            MessageKind::NoOp,
            |_: &NotificationMessage, _: u64| -> Result<(), HandlerError> { Ok(()) },
        );
        PipelineDeps::new(gateway, MemoryCursorStore::new(), registry, device())
    }

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        let config = PipelineConfig { max_pending: 0, ..PipelineConfig::default() };
        let err = NotificationPipeline::start(config, deps(ScriptedGateway::new()))
            .err()
            .expect("zero capacity");
        assert!(matches!(err, CourierError::Config(_)));
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let pipeline =
            NotificationPipeline::start(PipelineConfig::default(), deps(ScriptedGateway::new()))
                .expect("start");
        pipeline.shutdown();
        assert!(!pipeline.is_running());
        assert!(matches!(pipeline.submit(report_of(chain(1..=1))), Err(CourierError::Stopped)));
        assert!(matches!(pipeline.pull_now(), Err(CourierError::Stopped)));
        pipeline.shutdown();
    }

    #[test]
    fn disabled_polling_cannot_be_started() {
        let config = PipelineConfig { poll_interval_ms: 0, ..PipelineConfig::default() };
        let pipeline = NotificationPipeline::start(config, deps(ScriptedGateway::new())).expect("start");
        assert!(matches!(pipeline.start_poller(), Err(CourierError::Config(_))));
    }

    #[test]
    fn status_reports_processed_cursor() {
        let pipeline =
            NotificationPipeline::start(PipelineConfig::default(), deps(ScriptedGateway::new()))
                .expect("start");
        pipeline.submit(report_of(chain(1..=2))).expect("submit");
        assert!(pipeline.wait_until_idle(Duration::from_secs(5)));

        let status = pipeline.status();
        assert_eq!(status.cursor, Some(Cursor::new(2, 0)));
        assert_eq!(status.runs_completed, 1);
        assert_eq!(status.submitted_reports, 1);
        assert_eq!(status.last_stop.as_deref(), Some("caught up"));
        assert!(status.running);
    }
}
