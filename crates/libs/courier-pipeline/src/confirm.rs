use courier_core::{DeviceInfo, GatewayError, RemoteReportGateway};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

#[derive(Debug, Default)]
pub struct ConfirmationStats {
    pending: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    last_confirmed: AtomicI64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ConfirmationSnapshot {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub last_confirmed_id: i64,
}

impl ConfirmationStats {
    pub fn snapshot(&self) -> ConfirmationSnapshot {
        ConfirmationSnapshot {
            pending: self.pending.load(Ordering::Acquire),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_confirmed_id: self.last_confirmed.load(Ordering::Relaxed),
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

/// Producer side, held by the sequential processor. Reporting never waits
/// on the network.
#[derive(Clone, Debug)]
pub struct ConfirmationReporter {
    tx: UnboundedSender<i64>,
    stats: Arc<ConfirmationStats>,
}

impl ConfirmationReporter {
    pub fn channel() -> (Self, UnboundedReceiver<i64>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, stats: Arc::new(ConfirmationStats::default()) }, rx)
    }

    pub fn stats(&self) -> Arc<ConfirmationStats> {
        Arc::clone(&self.stats)
    }

    /// Queues a confirmation of everything up to `last_processed_id`.
    pub fn report(&self, last_processed_id: i64) {
        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(last_processed_id).is_err() {
            self.stats.pending.fetch_sub(1, Ordering::AcqRel);
            log::debug!(
                target: "courier::confirm",
                "confirmation worker gone, dropping confirmation of {last_processed_id}"
            );
        }
    }
}

/// Highest id in `ids`, if any. Later confirmations supersede earlier ones.
pub fn coalesce(ids: &[i64]) -> Option<i64> {
    ids.iter().copied().max()
}

/// Consumer side: sends the newest pending high-water mark to the gateway.
pub struct ConfirmationWorker {
    gateway: Arc<dyn RemoteReportGateway>,
    device: Arc<dyn DeviceInfo>,
    stats: Arc<ConfirmationStats>,
}

impl ConfirmationWorker {
    pub fn new(
        gateway: Arc<dyn RemoteReportGateway>,
        device: Arc<dyn DeviceInfo>,
        reporter: &ConfirmationReporter,
    ) -> Self {
        Self { gateway, device, stats: reporter.stats() }
    }

    pub async fn run(self, mut rx: UnboundedReceiver<i64>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            let mut batch = vec![first];
            while let Ok(id) = rx.try_recv() {
                batch.push(id);
            }
            let taken = batch.len() as u64;
            if let Some(target) = coalesce(&batch) {
                self.confirm(target).await;
            }
            self.stats.pending.fetch_sub(taken, Ordering::AcqRel);
        }
        log::debug!(target: "courier::confirm", "confirmation worker stopped");
    }

    async fn confirm(&self, target: i64) {
        let last = self.stats.last_confirmed.load(Ordering::Relaxed);
        if target <= last {
            log::debug!(
                target: "courier::confirm",
                "server already confirmed up to {last}, skipping {target}"
            );
            return;
        }

        let gateway = Arc::clone(&self.gateway);
        let device = Arc::clone(&self.device);
        let result = tokio::task::spawn_blocking(move || {
            let metadata = device.metadata();
            gateway.confirm_up_to(target, &metadata)
        })
        .await
        .unwrap_or_else(|err| Err(GatewayError::Network(format!("confirmation task failed: {err}"))));

        match result {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                self.stats.last_confirmed.fetch_max(target, Ordering::Relaxed);
                log::info!(target: "courier::confirm", "confirmed delivery up to {target}");
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    target: "courier::confirm",
                    "confirming delivery up to {target} failed: {err}"
                );
            }
        }
    }
}
