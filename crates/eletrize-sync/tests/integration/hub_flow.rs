//! Integration Tests: Hub Client Flow
//!
//! Tests the HTTP boundary against a local fake hub:
//! - Command query parameters and error diagnostics
//! - Both polling payload layouts
//! - HTML replies from a misconfigured backend
//! - A full dashboard session over HTTP

use std::time::Duration;

use eletrize_sync::{
    CommandRequest, CommandTransport, DashboardBuilder, Error, HostCapabilities, HubClient,
    InitialLoad, PollSource, PollerState, Reading,
};
use pretty_assertions::assert_eq;

use super::support::{as_element, eventually, id, FakeElement, FakeHub};

/// Test: Commands reach the proxy with device, command and value
#[tokio::test]
async fn test_command_reaches_proxy() {
    let hub = FakeHub::spawn().await;
    let client = HubClient::new(&hub.config()).expect("client");

    let reply = client
        .send(&CommandRequest::new(id("40"), "push").with_value("1"))
        .await
        .expect("send");

    assert_eq!(reply, Some(serde_json::json!({ "status": "ok" })));
    let commands = hub.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].get("device").map(String::as_str), Some("40"));
    assert_eq!(commands[0].get("command").map(String::as_str), Some("push"));
    assert_eq!(commands[0].get("value").map(String::as_str), Some("1"));
}

/// Test: Proxy errors are retried, then surfaced with their diagnostic
#[tokio::test]
async fn test_proxy_error_is_retried_then_reported() {
    let hub = FakeHub::spawn().await;
    hub.fail_commands(502, r#"{"error":"Hubitat error","details":"hub offline"}"#);
    let client = HubClient::new(&hub.config()).expect("client");

    let err = client
        .send(&CommandRequest::new(id("231"), "on"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::Http {
            status: 502,
            body: "Hubitat error: hub offline".to_string()
        }
    );
    assert_eq!(hub.commands().len(), 3);
}

/// Test: Client errors are not retried
#[tokio::test]
async fn test_bad_request_is_not_retried() {
    let hub = FakeHub::spawn().await;
    hub.fail_commands(400, r#"{"error":"unknown command"}"#);
    let client = HubClient::new(&hub.config()).expect("client");

    let err = client
        .send(&CommandRequest::new(id("231"), "dance"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Http { status: 400, .. }));
    assert_eq!(hub.commands().len(), 1);
}

/// Test: The keyed polling layout is decoded per device
#[tokio::test]
async fn test_keyed_poll_layout() {
    let hub = FakeHub::spawn().await;
    hub.reply_to_polls(
        200,
        r#"{"devices":{"231":{"state":"on","success":true},"232":{"success":false,"error":"timeout"}}}"#,
    );
    let client = HubClient::new(&hub.config()).expect("client");

    let snapshot = client.fetch(&[id("231"), id("232")]).await.expect("poll");

    assert_eq!(snapshot.get("231"), Some(&Reading::reported("on")));
    assert!(matches!(snapshot.get("232"), Some(Reading::Failed { .. })));
    assert_eq!(
        hub.poll_queries()[0].get("devices").map(String::as_str),
        Some("231,232")
    );
}

/// Test: The listed layout with attribute arrays is decoded the same way
#[tokio::test]
async fn test_listed_poll_layout_and_full_payload() {
    let hub = FakeHub::spawn().await;
    hub.reply_to_polls(
        200,
        r#"{"data":[{"id":"15","attributes":[{"name":"switch","currentValue":"on"},{"name":"volume","currentValue":42}]}]}"#,
    );
    let client = HubClient::new(&hub.config()).expect("client");

    let snapshot = client.fetch_full().await.expect("poll");

    assert_eq!(snapshot.get("15").and_then(Reading::state), Some("on"));
    assert_eq!(
        hub.poll_queries()[0].get("full").map(String::as_str),
        Some("1")
    );
}

/// Test: An HTML page instead of JSON is a malformed response
#[tokio::test]
async fn test_html_poll_reply_is_malformed() {
    let hub = FakeHub::spawn().await;
    hub.reply_to_polls(200, "<!DOCTYPE html><html><body>Login</body></html>");
    let client = HubClient::new(&hub.config()).expect("client");

    let err = client.fetch(&[id("231")]).await.unwrap_err();

    assert!(matches!(err, Error::MalformedResponse(_)));
    assert!(client.health_check().await.is_ok());
    assert_eq!(hub.health_hits(), 1);
}

/// Test: A dashboard over HTTP loads, then backs off on an HTML reply
#[tokio::test]
async fn test_dashboard_session_over_http() {
    let hub = FakeHub::spawn().await;
    hub.reply_to_polls(200, r#"{"devices":{"231":{"state":"on","success":true}}}"#);
    let mut config = hub.config();
    config.tracked_devices = vec![id("231")];

    let dashboard = DashboardBuilder::new()
        .config(config)
        .capabilities(HostCapabilities::full())
        .build()
        .expect("dashboard");
    let control = FakeElement::device("231");

    let page = FakeElement::container();
    page.append(&control);
    let load = dashboard.start(Some(as_element(&page))).await;
    assert_eq!(load, InitialLoad::Hub { applied: 1, failed: vec![] });
    assert_eq!(control.shown().as_deref(), Some("on"));
    assert_eq!(hub.health_hits(), 1);

    // Misconfigured backend starts serving its login page.
    hub.reply_to_polls(200, "<html><head><title>Login</title></head></html>");
    dashboard.reconciler.stop();
    dashboard.reconciler.start();

    let backed_off = eventually(Duration::from_secs(2), || {
        matches!(dashboard.reconciler.state(), PollerState::BackingOff { .. })
    })
    .await;
    assert!(backed_off);
    assert_eq!(control.shown().as_deref(), Some("on"));

    dashboard.dispatcher.set_device_state(&id("231"), "off").await.expect("command");
    let last = hub.commands().pop().expect("command sent");
    assert_eq!(last.get("command").map(String::as_str), Some("off"));

    dashboard.shutdown().await;
}
