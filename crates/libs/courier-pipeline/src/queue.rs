use courier_core::NotificationReport;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// Bounded FIFO of reports that evicts the oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct PendingReports {
    buf: VecDeque<NotificationReport>,
    capacity: usize,
}

impl PendingReports {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends `report`, returning the evicted report when the buffer was full.
    pub fn push(&mut self, report: NotificationReport) -> Option<NotificationReport> {
        let evicted = if self.buf.len() >= self.capacity { self.buf.pop_front() } else { None };
        self.buf.push_back(report);
        evicted
    }

    pub fn pop(&mut self) -> Option<NotificationReport> {
        self.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationReport> {
        self.buf.iter()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Queued,
    QueuedDroppedOldest { dropped_previous_id: i64, dropped_maximum_id: i64 },
}

/// Multi-producer, single-consumer ingestion buffer.
///
/// `submit` never blocks on processing: it takes a short lock, appends and
/// wakes the consumer.
pub struct IngestionQueue {
    pending: Mutex<PendingReports>,
    ready: Notify,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(PendingReports::new(capacity)),
            ready: Notify::new(),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn submit(&self, report: NotificationReport) -> SubmitOutcome {
        let (previous_id, maximum_id) = (report.previous_id, report.maximum_id);
        let evicted = {
            let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            guard.push(report)
        };
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();

        match evicted {
            None => {
                log::debug!(
                    target: "courier::queue",
                    "report queued previous_id={previous_id} maximum_id={maximum_id}"
                );
                SubmitOutcome::Queued
            }
            Some(dropped) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                log::warn!(
                    target: "courier::queue",
                    "report queue full, dropped oldest previous_id={} maximum_id={} dropped_total={total}",
                    dropped.previous_id,
                    dropped.maximum_id
                );
                SubmitOutcome::QueuedDroppedOldest {
                    dropped_previous_id: dropped.previous_id,
                    dropped_maximum_id: dropped.maximum_id,
                }
            }
        }
    }

    pub fn try_next(&self) -> Option<NotificationReport> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    /// Waits for the next report in arrival order.
    pub async fn next(&self) -> NotificationReport {
        loop {
            if let Some(report) = self.try_next() {
                return report;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).capacity()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discards everything buffered. Returns how many reports were dropped.
    pub fn clear(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear()
    }

    /// Maximum ids of the buffered reports, oldest first.
    pub fn snapshot_maximum_ids(&self) -> Vec<i64> {
        let guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        guard.iter().map(|report| report.maximum_id).collect()
    }
}
