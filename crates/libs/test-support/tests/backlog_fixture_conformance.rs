use courier_core::{validate_report, MessageKind, NotificationMessage, NotificationReport};
use serde_json::Value;
use std::fs;

fn load_fixture() -> Value {
    let path = test_support::workspace_root()
        .join("docs/fixtures/notifications/backlog.sample.json");
    let raw = fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&raw).expect("parse backlog fixture json")
}

#[test]
fn fixture_backlog_is_a_valid_chain() {
    let fixture = load_fixture();
    let backlog: Vec<NotificationMessage> =
        serde_json::from_value(fixture["backlog"].clone()).expect("deserialize backlog");
    let report = test_support::report_of(backlog);
    validate_report(&report).expect("backlog should chain from zero");
    assert_eq!(report.previous_id, 0);
}

#[test]
fn fixture_pushes_are_well_formed_reports() {
    let fixture = load_fixture();
    let pushes: Vec<NotificationReport> =
        serde_json::from_value(fixture["pushes"].clone()).expect("deserialize pushes");
    assert!(!pushes.is_empty());
    for push in &pushes {
        validate_report(push).expect("push report should be well formed");
    }
    assert!(pushes.iter().any(|push| push.is_empty() && push.maximum_id > push.previous_id));
}

#[test]
fn fixture_only_uses_known_message_types() {
    let fixture = load_fixture();
    let backlog: Vec<NotificationMessage> =
        serde_json::from_value(fixture["backlog"].clone()).expect("deserialize backlog");
    for message in &backlog {
        assert!(!message.kind().is_unknown(), "unexpected type {}", message.message_type);
    }
    assert!(backlog.iter().any(|m| m.kind() == MessageKind::FulfillIncomingSwap));
}
