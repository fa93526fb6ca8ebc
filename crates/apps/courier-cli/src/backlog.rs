use anyhow::{bail, Context};
use courier_core::{
    DeviceMetadata, GatewayError, HandlerError, HandlerRegistry, MessageHandler, MessageKind,
    NotificationMessage, NotificationReport, RemoteReportGateway,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Reads a backlog file. Accepts either a bare array of messages or an
/// object carrying them under `backlog`.
pub fn load_backlog(path: &Path) -> anyhow::Result<Vec<NotificationMessage>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read backlog {}", path.display()))?;
    parse_backlog(&raw).with_context(|| format!("invalid backlog {}", path.display()))
}

pub fn parse_backlog(raw: &str) -> anyhow::Result<Vec<NotificationMessage>> {
    let value: JsonValue = serde_json::from_str(raw)?;
    let list = match value {
        JsonValue::Array(_) => value,
        JsonValue::Object(mut map) => match map.remove("backlog") {
            Some(list) => list,
            None => bail!("expected a `backlog` array"),
        },
        _ => bail!("expected an array of messages"),
    };
    let mut messages: Vec<NotificationMessage> = serde_json::from_value(list)?;
    messages.sort_by_key(|message| message.id);
    Ok(messages)
}

#[derive(Default)]
struct GatewayLog {
    fetches: u64,
    confirmations: Vec<i64>,
}

/// Serves a fixed backlog the way the server does: everything after the
/// requested id, truncated to `page_size`, with `maximum_id` set to the end
/// of the backlog.
pub struct BacklogGateway {
    messages: Vec<NotificationMessage>,
    page_size: usize,
    log: Mutex<GatewayLog>,
}

impl BacklogGateway {
    pub fn new(messages: Vec<NotificationMessage>, page_size: usize) -> Self {
        Self { messages, page_size: page_size.max(1), log: Mutex::new(GatewayLog::default()) }
    }

    pub fn maximum_id(&self) -> i64 {
        self.messages.last().map(|message| message.id).unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn fetches(&self) -> u64 {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).fetches
    }

    pub fn confirmations(&self) -> Vec<i64> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).confirmations.clone()
    }
}

impl RemoteReportGateway for BacklogGateway {
    fn fetch_after(&self, after_id: i64) -> Result<NotificationReport, GatewayError> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).fetches += 1;
        let page: Vec<NotificationMessage> = self
            .messages
            .iter()
            .filter(|message| message.id > after_id)
            .take(self.page_size)
            .cloned()
            .collect();
        log::debug!(target: "courier::cli", "served {} message(s) after {after_id}", page.len());
        Ok(NotificationReport::new(after_id, self.maximum_id().max(after_id), page))
    }

    fn confirm_up_to(&self, id: i64, device: &DeviceMetadata) -> Result<(), GatewayError> {
        log::info!(
            target: "courier::cli",
            "confirmed up to {id} for {} ({})",
            device.model,
            device.standby_bucket
        );
        self.log.lock().unwrap_or_else(PoisonError::into_inner).confirmations.push(id);
        Ok(())
    }
}

/// Handler used by `replay`: logs each message and counts it per type, or
/// fails every attempt when the type was listed with `--fail-type`.
#[derive(Clone)]
pub struct ReplayHandler {
    fail: bool,
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl ReplayHandler {
    fn failing(counts: Arc<Mutex<HashMap<String, u64>>>) -> Self {
        Self { fail: true, counts }
    }
}

impl MessageHandler for ReplayHandler {
    fn handle(&self, message: &NotificationMessage, retry: u64) -> Result<(), HandlerError> {
        if self.fail {
            log::warn!(
                target: "courier::cli",
                "failing {} ({}) on attempt {}",
                message.id,
                message.message_type,
                retry + 1
            );
            return Err(HandlerError::failed(&message.message_type, "rejected by --fail-type"));
        }
        log::info!(
            target: "courier::cli",
            "handled {} ({}, {} byte payload)",
            message.id,
            message.message_type,
            message.payload.len()
        );
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(message.message_type.clone())
            .or_default() += 1;
        Ok(())
    }
}

/// Registry with a replay handler for every known type; `fail_types` get a
/// handler that always fails instead.
pub fn replay_registry(
    fail_types: &[String],
) -> (HandlerRegistry, Arc<Mutex<HashMap<String, u64>>>) {
    let counts = Arc::new(Mutex::new(HashMap::new()));
    let handler = ReplayHandler { fail: false, counts: Arc::clone(&counts) };
    let mut registry = HandlerRegistry::new();
    for kind in MessageKind::KNOWN {
        registry.register(kind, handler.clone());
    }
    for raw in fail_types {
        registry.register(MessageKind::from_wire(raw), ReplayHandler::failing(Arc::clone(&counts)));
    }
    (registry, counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64, message_type: &str) -> NotificationMessage {
        NotificationMessage::new(id, id - 1, message_type)
    }

    #[test]
    fn parses_bare_and_wrapped_backlogs() {
        let bare = r#"[{"id":2,"previousId":1,"messageType":"noop"},
                       {"id":1,"previousId":0,"messageType":"noop"}]"#;
        let ids: Vec<i64> = parse_backlog(bare).expect("bare").iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let wrapped = r#"{"description":"x","backlog":[{"id":1,"previousId":0,"messageType":"noop"}]}"#;
        assert_eq!(parse_backlog(wrapped).expect("wrapped").len(), 1);

        assert!(parse_backlog(r#"{"messages":[]}"#).is_err());
        assert!(parse_backlog("42").is_err());
    }

    #[test]
    fn gateway_pages_after_the_requested_id() {
        let gateway = BacklogGateway::new((1..=5).map(|id| message(id, "noop")).collect(), 2);
        let page = gateway.fetch_after(1).expect("page");
        assert_eq!(page.previous_id, 1);
        assert_eq!(page.maximum_id, 5);
        assert_eq!(page.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 3]);

        let tail = gateway.fetch_after(5).expect("tail");
        assert!(tail.is_empty());
        assert_eq!(tail.maximum_id, 5);
        assert_eq!(gateway.fetches(), 2);
    }

    #[test]
    fn gateway_records_confirmations() {
        let gateway = BacklogGateway::new(Vec::new(), 10);
        let device = DeviceMetadata::new("test", "linux", "ACTIVE");
        gateway.confirm_up_to(4, &device).expect("confirm");
        assert_eq!(gateway.confirmations(), vec![4]);
        assert_eq!(gateway.maximum_id(), 0);
    }

    #[test]
    fn fail_types_override_known_handlers() {
        let (registry, counts) = replay_registry(&["noop".to_string()]);
        assert!(registry.dispatch(&message(1, "noop"), 0).is_err());
        registry.dispatch(&message(2, "contact/new"), 0).expect("known type handled");
        let counts = counts.lock().expect("counts mutex poisoned");
        assert_eq!(counts.get("contact/new"), Some(&1));
        assert_eq!(counts.get("noop"), None);
    }
}
