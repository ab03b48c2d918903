mod common;

use common::{sample_body, Behavior, MockServer};
use rangedl::probe::probe;
use rangedl::transport::Method;
use rangedl::EngineConfig;
use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::test]
async fn head_with_accept_ranges_is_enough() {
    let server = MockServer::new(sample_body(5000), Behavior::default());
    let result = probe(server.as_ref(), "http://files.test/a", &BTreeMap::new(), &EngineConfig::default()).await;

    assert!(result.supports_ranges);
    assert_eq!(result.total_bytes, 5000);
    assert!(!result.access_denied);
    assert_eq!(server.seen().len(), 1);
    assert_eq!(server.seen()[0].method, Method::Head);
}

#[tokio::test]
async fn head_rejecting_host_goes_straight_to_ranged_get() {
    let server = MockServer::new(sample_body(5000), Behavior::default());
    let config = EngineConfig {
        head_rejecting_hosts: vec!["files.test".to_string()],
        ..EngineConfig::default()
    };
    let result = probe(server.as_ref(), "http://files.test/a", &BTreeMap::new(), &config).await;

    assert!(result.supports_ranges);
    assert_eq!(result.total_bytes, 5000);
    let seen = server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, Method::Get);
    assert_eq!(seen[0].range.as_deref(), Some("bytes=0-0"));
}

#[tokio::test]
async fn full_body_answer_means_no_range_support() {
    let server = MockServer::new(
        sample_body(5000),
        Behavior {
            ranges: false,
            ..Behavior::default()
        },
    );
    let result = probe(server.as_ref(), "http://files.test/a", &BTreeMap::new(), &EngineConfig::default()).await;

    assert!(!result.supports_ranges);
    assert_eq!(result.total_bytes, 5000);
    assert_eq!(server.seen().len(), 2);
}

#[tokio::test]
async fn denied_access_is_reported_separately() {
    let mut behavior = Behavior::default();
    behavior.denied_urls.insert("http://files.test/locked".to_string());
    let server = MockServer::new(sample_body(5000), behavior);
    let result = probe(
        server.as_ref(),
        "http://files.test/locked",
        &BTreeMap::new(),
        &EngineConfig::default(),
    )
    .await;

    assert!(!result.supports_ranges);
    assert!(result.access_denied);
}

#[tokio::test]
async fn request_headers_are_forwarded() {
    let server = MockServer::new(sample_body(10), Behavior::default());
    let mut headers = BTreeMap::new();
    headers.insert("cookie".to_string(), "session=1".to_string());
    let result = probe(server.as_ref(), "http://files.test/a", &headers, &EngineConfig::default()).await;

    assert!(result.supports_ranges);
    assert_eq!(
        server.seen()[0].headers.get("cookie").map(String::as_str),
        Some("session=1")
    );
}

#[tokio::test]
async fn silent_server_yields_inconclusive_result() {
    let server = MockServer::new(
        sample_body(5000),
        Behavior {
            hang_all: true,
            ..Behavior::default()
        },
    );
    let config = EngineConfig {
        stall_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        probe(server.as_ref(), "http://files.test/a", &BTreeMap::new(), &config),
    )
    .await
    .expect("gives up on its own");

    assert!(!result.supports_ranges);
    assert_eq!(result.total_bytes, 0);
    assert!(!result.access_denied);
    assert_eq!(server.seen().len(), 2);
}
