use crate::error::HandlerError;
use crate::types::{MessageKind, NotificationMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Applies one notification to local state.
///
/// `retry` is the number of consecutive failures already recorded for this
/// message (0 on the first attempt).
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &NotificationMessage, retry: u64) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&NotificationMessage, u64) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &NotificationMessage, retry: u64) -> Result<(), HandlerError> {
        self(message, retry)
    }
}

/// Whether exhausting the retry budget may advance the cursor past a
/// failing message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Skippability {
    Skippable,
    NonSkippable,
}

pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
    non_skippable: BTreeSet<MessageKind>,
    unknown_skippable: bool,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut non_skippable = BTreeSet::new();
        non_skippable.insert(MessageKind::FulfillIncomingSwap);
        Self { handlers: HashMap::new(), non_skippable, unknown_skippable: true }
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: MessageKind,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn mark_non_skippable(&mut self, kind: MessageKind) -> &mut Self {
        self.non_skippable.insert(kind);
        self
    }

    /// Classification applied to message types without a registered handler.
    pub fn set_unknown_skippable(&mut self, skippable: bool) -> &mut Self {
        self.unknown_skippable = skippable;
        self
    }

    pub fn is_registered(&self, kind: &MessageKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn skippability(&self, kind: &MessageKind) -> Skippability {
        if self.non_skippable.contains(kind) {
            return Skippability::NonSkippable;
        }
        if !self.is_registered(kind) && !self.unknown_skippable {
            return Skippability::NonSkippable;
        }
        Skippability::Skippable
    }

    /// Runs the handler for `message`. A panicking handler is reported as a
    /// failure like any other.
    pub fn dispatch(&self, message: &NotificationMessage, retry: u64) -> Result<(), HandlerError> {
        let kind = message.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            return Err(HandlerError::UnknownType(message.message_type.clone()));
        };
        match catch_unwind(AssertUnwindSafe(|| handler.handle(message, retry))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_owned());
                Err(HandlerError::failed(kind.as_wire(), reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn noop(_: &NotificationMessage, _: u64) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn dispatch_routes_by_kind_and_passes_retry() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let captured = Arc::clone(&seen);
        let mut registry = HandlerRegistry::new();
        registry.register(
            MessageKind::NewOperation,
            move |_: &NotificationMessage, retry: u64| -> Result<(), HandlerError> {
                captured.store(retry, Ordering::SeqCst);
                Ok(())
            },
        );

        let message = NotificationMessage::new(1, 0, "operation/new");
        registry.dispatch(&message, 2).expect("dispatch");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_handler_is_unknown_type_failure() {
        let registry = HandlerRegistry::new();
        let err = registry
            .dispatch(&NotificationMessage::new(1, 0, "wallet/mystery"), 0)
            .expect_err("no handler");
        assert_eq!(err, HandlerError::UnknownType("wallet/mystery".into()));
    }

    #[test]
    fn panicking_handler_becomes_failure() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            MessageKind::NoOp,
            |_: &NotificationMessage, _: u64| -> Result<(), HandlerError> { panic!("boom") },
        );
        let err = registry.dispatch(&NotificationMessage::new(1, 0, "noop"), 0).expect_err("panic");
        assert_eq!(err, HandlerError::failed("noop", "boom"));
    }

    #[test]
    fn skippability_defaults() {
        let mut registry = HandlerRegistry::new();
        registry.register(MessageKind::NoOp, noop);
        assert_eq!(registry.skippability(&MessageKind::NoOp), Skippability::Skippable);
        assert_eq!(
            registry.skippability(&MessageKind::FulfillIncomingSwap),
            Skippability::NonSkippable
        );
        let unknown = MessageKind::from_wire("wallet/mystery");
        assert_eq!(registry.skippability(&unknown), Skippability::Skippable);

        registry.set_unknown_skippable(false);
        assert_eq!(registry.skippability(&unknown), Skippability::NonSkippable);
        assert_eq!(registry.skippability(&MessageKind::NoOp), Skippability::Skippable);
    }
}
