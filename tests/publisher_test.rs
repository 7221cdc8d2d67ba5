use rsp_approx::engine::{Binding, ResultTick};
use rsp_approx::event_log::read_event_log;
use rsp_approx::publisher::AGGREGATION_EVENT_BASE;
use rsp_approx::{EventLog, MemoryBroker, PublishPolicy, Publisher};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

fn tick(bindings: &[(&str, &str)]) -> ResultTick {
    ResultTick {
        query: "output#1".into(),
        window: "https://rsp.jsw1".into(),
        timestamp_from: 0,
        timestamp_to: 60_000,
        bindings: bindings.iter().map(|(v, x)| Binding::new(*v, *x)).collect(),
    }
}

fn payload(message: &rsp_approx::broker::BrokerMessage) -> String {
    String::from_utf8(message.payload.clone()).unwrap()
}

fn subject(payload: &str) -> String {
    payload
        .split_whitespace()
        .next()
        .unwrap()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

#[tokio::test]
async fn test_failed_publish_does_not_block_next_tick() {
    let broker = MemoryBroker::default();
    let publisher = Publisher::new(Arc::new(broker.clone()), "output");

    broker.fail_next_publishes(1);
    assert_eq!(publisher.handle_tick(&tick(&[("avgX", "1.5")])).await, 0);
    assert_eq!(publisher.handle_tick(&tick(&[("avgX", "2.5")])).await, 1);

    let published = broker.published_on("output");
    assert_eq!(published.len(), 1);
    assert!(payload(&published[0]).contains("\"2.5\"^^<http://www.w3.org/2001/XMLSchema#float>"));
    assert_eq!(publisher.stats().failed(), 1);
    assert_eq!(publisher.stats().published(), 1);
}

#[tokio::test]
async fn test_one_event_per_binding_in_order() {
    let broker = MemoryBroker::default();
    let publisher = Publisher::new(Arc::new(broker.clone()), "output").with_policy(PublishPolicy::Wait);

    let count = publisher
        .handle_tick(&tick(&[("avgX", "1"), ("avgY", "2"), ("avgZ", "3")]))
        .await;
    assert_eq!(count, 3);

    let published = broker.published_on("output");
    assert_eq!(published.len(), 3);
    for (i, message) in published.iter().enumerate() {
        assert!(payload(message).contains(&format!("\"{}\"^^", i + 1)));
    }

    let ids: HashSet<_> = published.iter().map(|m| subject(&payload(m))).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.starts_with(AGGREGATION_EVENT_BASE)));
}

#[tokio::test]
async fn test_malformed_ticks_are_ignored() {
    let broker = MemoryBroker::default();
    let publisher = Publisher::new(Arc::new(broker.clone()), "output");

    assert_eq!(publisher.handle_tick(&tick(&[])).await, 0);
    assert_eq!(publisher.handle_tick(&tick(&[("label", "hello")])).await, 0);
    assert!(broker.published().is_empty());
    assert_eq!(publisher.stats().malformed_ticks(), 2);
}

#[tokio::test]
async fn test_unit_statement_is_attached() {
    let broker = MemoryBroker::default();
    let publisher = Publisher::new(Arc::new(broker.clone()), "output")
        .with_unit(Some("http://qudt.org/vocab/unit/M-PER-SEC2".into()));

    publisher.handle_tick(&tick(&[("avgX", "0.25")])).await;
    let text = payload(&broker.published_on("output")[0]);
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains("<https://saref.etsi.org/core/isMeasuredIn> <http://qudt.org/vocab/unit/M-PER-SEC2> ."));
}

#[tokio::test]
async fn test_spawned_publisher_logs_values_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("approximation_log.csv");
    let event_log = EventLog::open(&log_path).unwrap();

    let broker = MemoryBroker::default();
    let (tx, rx) = mpsc::channel(8);
    let handle = Publisher::new(Arc::new(broker.clone()), "output")
        .with_event_log(event_log)
        .spawn(rx);

    tx.send(tick(&[("avgX", "42.5")])).await.unwrap();
    tx.send(tick(&[])).await.unwrap();
    tx.send(tick(&[("avgY", "-1.25")])).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(broker.published_on("output").len(), 2);
    let messages: Vec<_> = read_event_log(&log_path)
        .unwrap()
        .into_iter()
        .map(|r| r.message)
        .collect();
    assert_eq!(messages, ["42.5", "-1.25"]);
}
