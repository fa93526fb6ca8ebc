use courier_core::{
    Cursor, HandlerRegistry, MemoryCursorStore, MessageKind, NotificationMessage,
    NotificationReport,
};
use courier_pipeline::{NotificationPipeline, PipelineConfig, PipelineDeps};
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use test_support::{device, RecordingHandler, ScriptedGateway};

#[derive(Deserialize)]
struct BacklogFixture {
    backlog: Vec<NotificationMessage>,
    pushes: Vec<NotificationReport>,
}

fn load_fixture() -> BacklogFixture {
    let path =
        test_support::workspace_root().join("docs/fixtures/notifications/backlog.sample.json");
    let raw = fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&raw).expect("parse backlog fixture")
}

#[test]
fn replaying_device_pushes_converges_on_the_server_backlog() {
    let fixture = load_fixture();
    let gateway = ScriptedGateway::with_backlog(fixture.backlog.clone(), 3);
    let handler = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    for kind in MessageKind::KNOWN {
        registry.register(kind, handler.clone());
    }
    let store = Arc::new(MemoryCursorStore::new());
    let deps = PipelineDeps::new(gateway.clone(), Arc::clone(&store), registry, device());
    let pipeline = NotificationPipeline::start(PipelineConfig::default(), deps).expect("start");

    for push in fixture.pushes {
        pipeline.submit(push).expect("submit push");
        assert!(pipeline.wait_until_idle(Duration::from_secs(10)));
    }

    let expected: Vec<i64> = fixture.backlog.iter().map(|m| m.id).collect();
    assert_eq!(handler.ids(), expected);
    assert_eq!(pipeline.status().cursor, Some(Cursor::new(8, 0)));

    // The late push after id 2 starts at 5, so the gap is refetched from 2.
    assert_eq!(gateway.fetches(), vec![2, 5]);

    let confirmations = gateway.confirmations();
    assert_eq!(confirmations.first(), Some(&2));
    assert_eq!(confirmations.last(), Some(&8));
    assert!(confirmations.windows(2).all(|pair| pair[0] < pair[1]));
}
