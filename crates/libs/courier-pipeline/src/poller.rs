use crate::queue::SubmitOutcome;
use courier_core::CourierError;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollerExit {
    /// `PollerHandle::stop` was called or the handle dropped.
    Stopped,
    /// The pipeline shut down.
    Shutdown,
    /// The gateway rejected the session; polling cannot succeed until the
    /// user signs in again.
    SessionEnded,
}

#[derive(Debug, Default)]
struct PollerState {
    running: AtomicBool,
    polls: AtomicU64,
    failures: AtomicU64,
    exit: Mutex<Option<PollerExit>>,
}

/// Control handle for a running poller. Dropping it stops the poller.
#[derive(Debug)]
pub struct PollerHandle {
    stop_tx: watch::Sender<bool>,
    state: Arc<PollerState>,
}

impl PollerHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Pull attempts made so far, failed ones included.
    pub fn polls(&self) -> u64 {
        self.state.polls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::Relaxed)
    }

    pub fn exit(&self) -> Option<PollerExit> {
        *self.state.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Periodic pull trigger.
pub struct Poller {
    interval: Duration,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self { interval: interval.max(Duration::from_millis(1)) }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the polling loop on `runtime`. `pull` is invoked once per tick;
    /// the loop ends on stop, on pipeline shutdown or on an expired session.
    pub fn spawn<F, Fut>(
        self,
        runtime: &tokio::runtime::Handle,
        pull: F,
        shutdown: watch::Receiver<bool>,
    ) -> PollerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<SubmitOutcome, CourierError>> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = Arc::new(PollerState::default());
        state.running.store(true, Ordering::Release);
        runtime.spawn(poll_loop(self.interval, pull, Arc::clone(&state), stop_rx, shutdown));
        PollerHandle { stop_tx, state }
    }
}

/// Marks the poller stopped however the loop ends, including when the
/// runtime drops the task during shutdown.
struct RunningGuard(Arc<PollerState>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut exit = self.0.exit.lock().unwrap_or_else(PoisonError::into_inner);
        exit.get_or_insert(PollerExit::Shutdown);
        self.0.running.store(false, Ordering::Release);
    }
}

async fn poll_loop<F, Fut>(
    interval: Duration,
    mut pull: F,
    state: Arc<PollerState>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SubmitOutcome, CourierError>>,
{
    let _guard = RunningGuard(Arc::clone(&state));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!(target: "courier::poller", "polling every {}ms", interval.as_millis());

    let exit = loop {
        if *stop.borrow() {
            break PollerExit::Stopped;
        }
        if *shutdown.borrow() {
            break PollerExit::Shutdown;
        }
        tokio::select! {
            biased;
            _ = stop.changed() => break PollerExit::Stopped,
            _ = shutdown.changed() => break PollerExit::Shutdown,
            _ = ticker.tick() => {}
        }

        state.polls.fetch_add(1, Ordering::Relaxed);
        match pull().await {
            Ok(_) => {}
            Err(CourierError::Gateway(err)) if err.is_fatal_for_polling() => {
                state.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: "courier::poller", "stopping poller: {err}");
                break PollerExit::SessionEnded;
            }
            Err(err) => {
                state.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: "courier::poller", "poll failed, will retry: {err}");
            }
        }
    };

    *state.exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(exit);
    log::info!(target: "courier::poller", "poller exited ({exit:?})");
}
