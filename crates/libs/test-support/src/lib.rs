//! Scripted collaborators and report builders shared by the courier test suites.

use courier_core::{
    DeviceMetadata, GatewayError, HandlerError, MessageHandler, MessageKind, NotificationMessage,
    NotificationReport, RemoteReportGateway,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub fn message(id: i64, kind: MessageKind) -> NotificationMessage {
    NotificationMessage::new(id, id - 1, kind.as_wire())
}

pub fn noop(id: i64) -> NotificationMessage {
    message(id, MessageKind::NoOp)
}

/// Contiguous `NoOp` messages for every id in `ids`.
pub fn chain(ids: std::ops::RangeInclusive<i64>) -> Vec<NotificationMessage> {
    ids.map(noop).collect()
}

/// Report whose bookkeeping exactly covers `messages`.
pub fn report_of(messages: Vec<NotificationMessage>) -> NotificationReport {
    let previous_id = messages.first().map(|m| m.previous_id).unwrap_or(0);
    let maximum_id = messages.last().map(|m| m.id).unwrap_or(previous_id);
    NotificationReport::new(previous_id, maximum_id, messages)
}

/// Report claiming the server holds messages up to `maximum_id`.
pub fn report_with_max(maximum_id: i64, messages: Vec<NotificationMessage>) -> NotificationReport {
    let mut report = report_of(messages);
    report.maximum_id = maximum_id;
    report
}

pub fn device() -> DeviceMetadata {
    DeviceMetadata::new("test-device", "14", "ACTIVE")
}

pub fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(3)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct GatewayState {
    scripted: HashMap<i64, VecDeque<Result<NotificationReport, GatewayError>>>,
    backlog: Option<(Vec<NotificationMessage>, usize)>,
    fetches: Vec<i64>,
    confirms: Vec<(i64, DeviceMetadata)>,
    confirm_error: Option<GatewayError>,
    fetch_delay: Option<Duration>,
}

/// Gateway fake. Responses are scripted per `after_id` and consumed in
/// order, the last one repeating. In backlog mode unscripted fetches are
/// paged from an in-memory server backlog; otherwise they return an empty
/// report at the requested id.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog(messages: Vec<NotificationMessage>, page_size: usize) -> Self {
        let gateway = Self::new();
        gateway.lock().backlog = Some((messages, page_size.max(1)));
        gateway
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn script(&self, after_id: i64, response: Result<NotificationReport, GatewayError>) {
        self.lock().scripted.entry(after_id).or_default().push_back(response);
    }

    pub fn fail_confirms(&self, error: Option<GatewayError>) {
        self.lock().confirm_error = error;
    }

    pub fn delay_fetches(&self, delay: Duration) {
        self.lock().fetch_delay = Some(delay);
    }

    pub fn fetches(&self) -> Vec<i64> {
        self.lock().fetches.clone()
    }

    pub fn fetch_count(&self, after_id: i64) -> usize {
        self.lock().fetches.iter().filter(|id| **id == after_id).count()
    }

    pub fn confirmations(&self) -> Vec<i64> {
        self.lock().confirms.iter().map(|(id, _)| *id).collect()
    }

    pub fn confirmation_metadata(&self) -> Vec<DeviceMetadata> {
        self.lock().confirms.iter().map(|(_, device)| device.clone()).collect()
    }

    pub fn push_backlog(&self, messages: Vec<NotificationMessage>) {
        let mut state = self.lock();
        match state.backlog.as_mut() {
            Some((backlog, _)) => backlog.extend(messages),
            None => state.backlog = Some((messages, usize::MAX)),
        }
    }
}

impl RemoteReportGateway for ScriptedGateway {
    fn fetch_after(&self, after_id: i64) -> Result<NotificationReport, GatewayError> {
        let delay = {
            let mut state = self.lock();
            state.fetches.push(after_id);
            state.fetch_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(queue) = state.scripted.get_mut(&after_id) {
            let response = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
            if let Some(response) = response {
                return response;
            }
        }
        if let Some((backlog, page_size)) = state.backlog.as_ref() {
            let maximum_id = backlog.last().map(|m| m.id).unwrap_or(after_id).max(after_id);
            let page: Vec<NotificationMessage> =
                backlog.iter().filter(|m| m.id > after_id).take(*page_size).cloned().collect();
            return Ok(NotificationReport::new(after_id, maximum_id, page));
        }
        Ok(NotificationReport::empty(after_id, after_id))
    }

    fn confirm_up_to(&self, id: i64, device: &DeviceMetadata) -> Result<(), GatewayError> {
        let mut state = self.lock();
        state.confirms.push((id, device.clone()));
        match state.confirm_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Handler that records every `(id, retry)` it sees. Fails the first
/// `failures` attempts of each listed id, or every attempt when the id is
/// marked as always failing.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<(i64, u64)>>>,
    failures: Arc<Mutex<HashMap<i64, Option<u32>>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, id: i64, times: u32) -> &Self {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).insert(id, Some(times));
        self
    }

    pub fn fail_always(&self, id: i64) -> &Self {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).insert(id, None);
        self
    }

    pub fn calls(&self) -> Vec<(i64, u64)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }

    pub fn call_count(&self, id: i64) -> usize {
        self.calls().iter().filter(|(seen, _)| *seen == id).count()
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: &NotificationMessage, retry: u64) -> Result<(), HandlerError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((message.id, retry));

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get_mut(&message.id) {
            Some(None) => Err(HandlerError::failed(&message.message_type, "scripted failure")),
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(HandlerError::failed(&message.message_type, "scripted failure"))
            }
            _ => Ok(()),
        }
    }
}

/// Handler that rejects every message and counts the attempts.
#[derive(Clone)]
pub struct FailingHandler {
    error: HandlerError,
    attempts: Arc<Mutex<u64>>,
}

impl FailingHandler {
    pub fn new(error: HandlerError) -> Self {
        Self { error, attempts: Arc::new(Mutex::new(0)) }
    }

    pub fn attempts(&self) -> u64 {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageHandler for FailingHandler {
    fn handle(&self, _message: &NotificationMessage, _retry: u64) -> Result<(), HandlerError> {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Err(self.error.clone())
    }
}
