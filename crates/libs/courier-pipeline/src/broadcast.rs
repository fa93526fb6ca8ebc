use courier_core::ProcessingState;
use tokio::sync::broadcast;

pub const DEFAULT_STATE_CAPACITY: usize = 64;

/// Fan-out of batch START/COMPLETE signals.
///
/// Emitting never blocks: subscribers that fall behind observe
/// `RecvError::Lagged` and miss the overwritten events.
#[derive(Clone, Debug)]
pub struct StateBroadcaster {
    tx: broadcast::Sender<ProcessingState>,
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_CAPACITY)
    }
}

impl StateBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingState> {
        self.tx.subscribe()
    }

    pub fn emit(&self, state: ProcessingState) {
        // No subscribers is the common case outside the UI.
        let _ = self.tx.send(state);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
