use serde::Serialize;
use thiserror::Error;

/// Phase of the batch currently owned by the sequential processor.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    #[default]
    Idle,
    Draining,
    PerMessageDispatch,
    Advancing,
}

impl BatchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::PerMessageDispatch => "per_message_dispatch",
            Self::Advancing => "advancing",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// A report was taken off the queue (or a repair page fetched).
    Drain,
    /// A message is about to be handed to its handler.
    Dispatch,
    /// The cursor is being persisted after a terminal outcome.
    Advance,
    Finish,
}

impl PhaseEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Dispatch => "dispatch",
            Self::Advance => "advance",
            Self::Finish => "finish",
        }
    }

    fn target(self) -> BatchPhase {
        match self {
            Self::Drain => BatchPhase::Draining,
            Self::Dispatch => BatchPhase::PerMessageDispatch,
            Self::Advance => BatchPhase::Advancing,
            Self::Finish => BatchPhase::Idle,
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("illegal batch transition `{event}` while {phase}")]
pub struct PhaseError {
    pub event: &'static str,
    pub phase: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchLifecycle {
    phase: BatchPhase,
    batches_started: u64,
}

impl BatchLifecycle {
    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    pub fn batches_started(&self) -> u64 {
        self.batches_started
    }

    pub fn is_idle(&self) -> bool {
        self.phase == BatchPhase::Idle
    }

    pub fn ensure_legal(&self, event: PhaseEvent) -> Result<(), PhaseError> {
        if legal_phases_for_event(event).contains(&self.phase) {
            return Ok(());
        }
        Err(PhaseError { event: event.as_str(), phase: self.phase.as_str() })
    }

    pub fn apply(&mut self, event: PhaseEvent) -> Result<BatchPhase, PhaseError> {
        self.ensure_legal(event)?;
        if event == PhaseEvent::Drain && self.phase == BatchPhase::Idle {
            self.batches_started = self.batches_started.saturating_add(1);
        }
        self.phase = event.target();
        Ok(self.phase)
    }
}

fn legal_phases_for_event(event: PhaseEvent) -> &'static [BatchPhase] {
    use BatchPhase as P;
    match event {
        PhaseEvent::Drain => &[P::Idle, P::Draining, P::PerMessageDispatch, P::Advancing],
        PhaseEvent::Dispatch => &[P::Draining, P::PerMessageDispatch, P::Advancing],
        PhaseEvent::Advance => &[P::PerMessageDispatch],
        PhaseEvent::Finish => &[P::Draining, P::PerMessageDispatch, P::Advancing],
    }
}
