//! Integration tests for the `reqwest` capture source.
//!
//! These tests run calls through [`CapturingClient`] against a mock upstream
//! and verify that:
//! - The caller sees exactly what the upstream sent
//! - Records carry method, URL, status, redacted headers and bodies
//! - Failed calls are recorded with status 0 and the original error returned
//! - Policy, pause state and uninstalled hooks are honoured
//! - Cancelled calls leave nothing in flight

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use server_devtools::broadcast::Notifier;
use server_devtools::capture::client::CapturingClient;
use server_devtools::capture::{Capture, CaptureHooks};
use server_devtools::collector::{Channel, EventCollector};
use server_devtools::policy::{CapturePolicy, PolicySnapshot, REDACTED, TRUNCATION_MARKER};
use server_devtools::types::{HttpMethod, NetworkRecord, NetworkSource};

// ============================================================================
// Test Helpers
// ============================================================================

/// A client wired to a fresh session capture using `policy`.
fn capturing(policy: PolicySnapshot) -> (CapturingClient, Capture, Arc<CaptureHooks>) {
    let capture = Capture::new(
        Arc::new(EventCollector::new(100, 100, Notifier::new())),
        Arc::new(CapturePolicy::new(policy, 10)),
    );
    let hooks = Arc::new(CaptureHooks::new());
    hooks.install(capture.clone());
    (CapturingClient::new(Arc::clone(&hooks)), capture, hooks)
}

fn only_request(capture: &Capture) -> Arc<NetworkRecord> {
    let requests = capture.collector().get_requests();
    assert_eq!(requests.len(), 1, "expected exactly one record: {requests:#?}");
    Arc::clone(&requests[0])
}

// ============================================================================
// Successful calls
// ============================================================================

#[tokio::test]
async fn records_successful_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/items"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-trace", "abc")
                .set_body_string("created"),
        )
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    let response = client
        .post(format!("{}/items", server.uri()))
        .header("content-type", "application/json")
        .body(r#"{"name":"widget"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.headers()["x-trace"], "abc");
    assert_eq!(response.text().await.unwrap(), "created");

    let record = only_request(&capture);
    assert_eq!(record.method, HttpMethod::Post);
    assert_eq!(record.url, format!("{}/items", server.uri()));
    assert_eq!(record.status, 201);
    assert_eq!(record.status_text, "Created");
    assert_eq!(record.source, NetworkSource::Reqwest);
    assert_eq!(record.request_headers["content-type"], "application/json");
    assert_eq!(record.request_body.as_deref(), Some(r#"{"name":"widget"}"#));
    assert_eq!(record.response_headers["x-trace"], "abc");
    assert_eq!(record.response_body.as_deref(), Some("created"));
    assert!(record.error.is_none());
    assert!(record.timing.end >= record.timing.start);
    assert!(!record.is_failure());
}

#[tokio::test]
async fn get_without_body_records_no_request_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    let response = client.get(server.uri()).send().await.unwrap();
    response.bytes().await.unwrap();

    let record = only_request(&capture);
    assert_eq!(record.method, HttpMethod::Get);
    assert_eq!(record.status, 404);
    assert_eq!(record.status_text, "Not Found");
    assert!(record.request_body.is_none());
    assert_eq!(record.response_body.as_deref(), Some(""));
    assert!(!record.is_failure(), "an error status is still a completed call");
}

#[tokio::test]
async fn sensitive_headers_are_redacted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc"))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    let response = client
        .get(server.uri())
        .header("Authorization", "Bearer secret")
        .header("X-Request-Id", "42")
        .send()
        .await
        .unwrap();

    // The upstream saw the real header; only the record is redacted.
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["set-cookie"], "session=abc");
    drop(response);

    let record = only_request(&capture);
    assert_eq!(record.request_headers["authorization"], REDACTED);
    assert_eq!(record.request_headers["x-request-id"], "42");
    assert_eq!(record.response_headers["set-cookie"], REDACTED);
}

#[tokio::test]
async fn response_body_is_truncated_in_record_only() {
    let server = MockServer::start().await;
    let body = "x".repeat(100);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.clone()))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot {
        truncate_body_bytes: 20,
        ..PolicySnapshot::default()
    });
    let text = client.get(server.uri()).send().await.unwrap().text().await.unwrap();

    assert_eq!(text, body);
    let record = only_request(&capture);
    let expected = format!("{}{TRUNCATION_MARKER}", "x".repeat(20));
    assert_eq!(record.response_body.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn body_capture_can_be_disabled() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stored"))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot {
        capture_request_bodies: false,
        capture_response_bodies: false,
        ..PolicySnapshot::default()
    });
    let text = client
        .put(server.uri())
        .body("payload")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(text, "stored");
    let record = only_request(&capture);
    assert!(record.request_body.is_none());
    assert!(record.response_body.is_none());
}

#[tokio::test]
async fn dropped_response_is_recorded_without_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("never read"))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    let response = client.get(server.uri()).send().await.unwrap();
    assert!(capture.collector().get_requests().is_empty());

    drop(response);

    let record = only_request(&capture);
    assert_eq!(record.status, 200);
    assert!(record.response_body.is_none());
    assert_eq!(capture.network().in_flight(), 0);
}

// ============================================================================
// Failed calls
// ============================================================================

#[tokio::test]
async fn connection_failure_is_recorded_with_status_zero() {
    // Bind then release a port so nothing is listening on it.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let url = format!("http://127.0.0.1:{port}/unreachable");

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    let err = client.get(&url).send().await.unwrap_err();
    assert!(err.is_connect());

    let record = only_request(&capture);
    assert_eq!(record.status, 0);
    assert_eq!(record.status_text, "Failed");
    assert_eq!(record.url, url);
    assert!(record.error.as_deref().is_some_and(|error| !error.is_empty()));
    assert!(record.response_body.is_none());
    assert!(record.is_failure());
}

// ============================================================================
// Pass-through
// ============================================================================

#[tokio::test]
async fn uninstalled_hooks_pass_calls_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, capture, hooks) = capturing(PolicySnapshot::default());
    hooks.uninstall();

    let response = client.get(server.uri()).send().await.unwrap();
    assert_eq!(response.content_length(), Some(5));
    assert_eq!(response.text().await.unwrap(), "plain");
    assert!(capture.collector().get_requests().is_empty());
}

#[tokio::test]
async fn paused_network_channel_drops_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    capture.collector().set_paused(Channel::Network, true);

    client.get(server.uri()).send().await.unwrap().bytes().await.unwrap();

    assert!(capture.collector().get_requests().is_empty());
    assert_eq!(capture.network().in_flight(), 0);
}

// ============================================================================
// Cancellation and response fidelity
// ============================================================================

#[tokio::test]
async fn cancelled_calls_leave_nothing_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    for _ in 0..20 {
        let send = client.post(server.uri()).body(vec![b'x'; 100_000]).send();
        assert!(timeout(Duration::from_millis(20), send).await.is_err());
    }

    assert_eq!(capture.network().in_flight(), 0);
    assert!(capture.collector().get_requests().is_empty());
}

#[tokio::test]
async fn tapped_response_matches_uninstrumented_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("twelve bytes"))
        .mount(&server)
        .await;

    let (client, capture, _hooks) = capturing(PolicySnapshot::default());
    let plain = client.inner().get(server.uri()).send().await.unwrap();
    let tapped = client.get(server.uri()).send().await.unwrap();

    assert_eq!(tapped.content_length(), plain.content_length());
    assert_eq!(tapped.content_length(), Some(12));
    assert_eq!(tapped.remote_addr(), plain.remote_addr());
    assert!(tapped.remote_addr().is_some());
    assert_eq!(tapped.url(), plain.url());
    assert_eq!(tapped.version(), plain.version());

    assert_eq!(tapped.text().await.unwrap(), "twelve bytes");
    assert_eq!(
        only_request(&capture).response_body.as_deref(),
        Some("twelve bytes")
    );
}
