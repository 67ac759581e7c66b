//! Integration Tests: Reconciliation Flow
//!
//! Tests the poll side of the engine:
//! - Initial load from the hub and the cached fallback
//! - Protection window boundaries
//! - Partial batch failures and secondary attributes
//! - Cadence changes and visibility pauses in the running loop

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eletrize_sync::{
    AttributeObserver, Dashboard, DashboardBuilder, DeviceId, Error, InitialLoad, PollerState,
    Reading, Snapshot,
};
use pretty_assertions::assert_eq;

use super::support::{
    as_element, id, CollectingNotifier, FakeElement, FakeTransport, ScriptedSource,
};

#[derive(Default)]
struct Attributes {
    seen: Mutex<Vec<(DeviceId, BTreeMap<String, String>)>>,
}

impl AttributeObserver for Attributes {
    fn on_attributes(&self, id: &DeviceId, attributes: &BTreeMap<String, String>) {
        self.seen.lock().unwrap().push((id.clone(), attributes.clone()));
    }
}

struct Session {
    dashboard: Dashboard,
    source: Arc<ScriptedSource>,
    notices: Arc<CollectingNotifier>,
    attributes: Arc<Attributes>,
}

fn session(tracked: &[&str]) -> Session {
    let source = ScriptedSource::new();
    let notices = Arc::new(CollectingNotifier::default());
    let attributes = Arc::new(Attributes::default());
    let dashboard = DashboardBuilder::new()
        .tracked_devices(tracked.iter().copied())
        .transport(FakeTransport::new())
        .poll_source(source.clone())
        .notifier(notices.clone())
        .attribute_observer(attributes.clone())
        .build()
        .expect("dashboard");
    Session {
        dashboard,
        source,
        notices,
        attributes,
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Test: First poll fills an empty store and every control of the device
#[tokio::test(start_paused = true)]
async fn test_first_poll_fills_store_and_controls() {
    let s = session(&["231"]);
    let page = FakeElement::container();
    let header = FakeElement::device("231");
    let tile = FakeElement::device("231");
    page.append(&header);
    page.append(&tile);
    s.source
        .push(Ok(Snapshot::new().with("231", Reading::reported("on"))));

    let load = s.dashboard.start(Some(as_element(&page))).await;

    assert_eq!(load, InitialLoad::Hub { applied: 1, failed: vec![] });
    assert_eq!(s.dashboard.store.get(&id("231")).as_deref(), Some("on"));
    assert_eq!(header.shown().as_deref(), Some("on"));
    assert_eq!(tile.shown().as_deref(), Some("on"));

    s.dashboard.shutdown().await;
}

/// Test: A successful initial load is not followed by an immediate second poll
#[tokio::test(start_paused = true)]
async fn test_start_does_not_poll_twice() {
    let s = session(&["231"]);
    s.source
        .set_fallback(Snapshot::new().with("231", Reading::reported("on")));

    let load = s.dashboard.start(None).await;
    assert!(matches!(load, InitialLoad::Hub { .. }));
    tokio::time::sleep(ms(100)).await;
    assert_eq!(s.source.calls(), 1);

    tokio::time::sleep(ms(5_000)).await;
    assert_eq!(s.source.calls(), 2);
    assert!(s.dashboard.reconciler.state().is_running());

    s.dashboard.shutdown().await;
}

/// Test: An unreachable hub falls back to stored states and notifies once
#[tokio::test(start_paused = true)]
async fn test_initial_load_falls_back_to_stored_states() {
    let s = session(&["231", "232"]);
    s.source.set_healthy(false);
    for _ in 0..3 {
        s.source.push(Err(Error::network("connection refused")));
    }
    s.dashboard.store.set(&id("231"), "on");
    let stored = FakeElement::device("231");
    let unknown = FakeElement::device("232");
    s.dashboard.registry.register_control(&as_element(&stored), &id("231"));
    s.dashboard.registry.register_control(&as_element(&unknown), &id("232"));

    let load = s.dashboard.load_initial_states().await;

    assert!(matches!(load, InitialLoad::Cached { error: Error::Network(_) }));
    assert_eq!(s.source.calls(), 3);
    assert_eq!(stored.shown().as_deref(), Some("on"));
    assert_eq!(unknown.shown().as_deref(), Some("off"));
    assert_eq!(s.notices.messages().len(), 1);
}

/// Test: Polls inside the protection window are ignored, after it they win
#[tokio::test(start_paused = true)]
async fn test_protection_window_expires() {
    let s = session(&["110"]);
    let control = FakeElement::device("110");
    s.dashboard.registry.register_control(&as_element(&control), &id("110"));
    s.source
        .set_fallback(Snapshot::new().with("110", Reading::reported("off")));

    s.dashboard.dispatcher.set_device_state(&id("110"), "on").await.unwrap();

    tokio::time::advance(ms(7_999)).await;
    s.dashboard.reconciler.poll_once().await.unwrap();
    assert_eq!(control.shown().as_deref(), Some("on"));

    tokio::time::advance(ms(1)).await;
    let report = s.dashboard.reconciler.poll_once().await.unwrap();
    assert_eq!(report.changed, vec![id("110")]);
    assert_eq!(control.shown().as_deref(), Some("off"));
    assert!(s.dashboard.ledger.is_empty());
}

/// Test: One unreadable device does not block the rest of the batch
#[tokio::test]
async fn test_partial_batch_failure() {
    let s = session(&["1", "2"]);
    s.dashboard.store.set(&id("1"), "on");
    let mut attributes = BTreeMap::new();
    attributes.insert("volume".to_string(), "35".to_string());
    let mut snapshot = Snapshot::new().with("1", Reading::failed("timeout"));
    snapshot.insert(
        id("2"),
        Reading::Reported {
            state: "on".to_string(),
            attributes: attributes.clone(),
        },
    );
    s.source.push(Ok(snapshot));

    let report = s.dashboard.reconciler.poll_once().await.unwrap();

    assert_eq!(report.failed, vec![id("1")]);
    assert_eq!(report.changed, vec![id("2")]);
    assert_eq!(s.dashboard.store.get(&id("1")).as_deref(), Some("on"));
    assert_eq!(
        *s.attributes.seen.lock().unwrap(),
        vec![(id("2"), attributes)]
    );
}

/// Test: Running loop backs off on errors and snaps back on change
#[tokio::test(start_paused = true)]
async fn test_loop_cadence_follows_outcomes() {
    let s = session(&["231"]);
    s.source.push(Err(Error::malformed("HTML instead of JSON")));
    s.source.push(Err(Error::network("refused")));
    s.source
        .push(Ok(Snapshot::new().with("231", Reading::reported("on"))));

    s.dashboard.reconciler.start();
    tokio::time::sleep(ms(1)).await;
    assert_eq!(
        s.dashboard.reconciler.state(),
        PollerState::BackingOff { interval: ms(7_500), failures: 1 }
    );

    tokio::time::sleep(ms(7_500)).await;
    assert_eq!(
        s.dashboard.reconciler.state(),
        PollerState::BackingOff { interval: ms(11_250), failures: 2 }
    );

    tokio::time::sleep(ms(11_250)).await;
    assert_eq!(
        s.dashboard.reconciler.state(),
        PollerState::Polling { interval: ms(5_000) }
    );
    assert_eq!(s.source.calls(), 3);
    assert_eq!(s.notices.messages().len(), 1);

    s.dashboard.reconciler.shutdown().await;
}

/// Test: Hiding the dashboard pauses polling until it is shown again
#[tokio::test(start_paused = true)]
async fn test_hidden_dashboard_does_not_poll() {
    let s = session(&["231"]);
    let reconciler = s.dashboard.reconciler.clone();

    reconciler.start();
    tokio::time::sleep(ms(1)).await;
    assert_eq!(s.source.calls(), 1);

    reconciler.set_visible(false);
    tokio::time::sleep(ms(60_000)).await;
    assert_eq!(s.source.calls(), 1);
    assert_eq!(reconciler.state(), PollerState::Stopped);

    reconciler.set_visible(true);
    tokio::time::sleep(ms(1)).await;
    assert_eq!(s.source.calls(), 2);

    reconciler.shutdown().await;
}
