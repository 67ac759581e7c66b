//! Integration Tests: Command Dispatch Flow
//!
//! Tests user-initiated commands end to end:
//! - Optimistic toggles racing against stale polls
//! - Rollback and notices when a command is not delivered
//! - Curtain push mapping per controller
//! - Master controls over groups (all-settled, pending flag)

use std::sync::Arc;
use std::time::Duration;

use eletrize_sync::{
    CommandRequest, Dashboard, DashboardBuilder, MasterKind, Reading, Snapshot,
};
use pretty_assertions::assert_eq;

use super::support::{
    as_element, id, CollectingNotifier, FakeElement, FakeTransport, ScriptedSource,
};

struct Session {
    dashboard: Arc<Dashboard>,
    transport: Arc<FakeTransport>,
    source: Arc<ScriptedSource>,
    notices: Arc<CollectingNotifier>,
}

fn session_with(transport: Arc<FakeTransport>) -> Session {
    let source = ScriptedSource::new();
    let notices = Arc::new(CollectingNotifier::default());
    let dashboard = DashboardBuilder::new()
        .tracked_devices(["110", "231"])
        .transport(transport.clone())
        .poll_source(source.clone())
        .notifier(notices.clone())
        .build()
        .expect("dashboard");
    Session {
        dashboard: Arc::new(dashboard),
        transport,
        source,
        notices,
    }
}

fn session() -> Session {
    session_with(FakeTransport::new())
}

/// Test: A poll fetched before a toggle cannot undo it
#[tokio::test(start_paused = true)]
async fn test_toggle_survives_stale_poll() {
    let s = session_with(FakeTransport::slow(Duration::from_millis(500)));
    let control = FakeElement::device_showing("110", "off");
    s.dashboard
        .registry
        .register_control(&as_element(&control), &id("110"));
    s.dashboard.store.set(&id("110"), "off");
    s.source
        .set_fallback(Snapshot::new().with("110", Reading::reported("off")));

    let toggle = {
        let dashboard = s.dashboard.clone();
        tokio::spawn(async move { dashboard.dispatcher.toggle_device(&id("110")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(control.shown().as_deref(), Some("on"));

    let report = s.dashboard.reconciler.poll_once().await.unwrap();
    assert_eq!(report.protected, vec![id("110")]);
    assert_eq!(control.shown().as_deref(), Some("on"));
    assert_eq!(s.dashboard.store.get(&id("110")).as_deref(), Some("on"));

    assert_eq!(toggle.await.unwrap().unwrap(), "on");
    assert_eq!(
        s.transport.sent(),
        vec![CommandRequest::new(id("110"), "on")]
    );
}

/// Test: An undelivered command reverts the control and raises a notice
#[tokio::test]
async fn test_failed_toggle_reverts_control() {
    let s = session();
    s.transport.make_unreachable("231");
    let control = FakeElement::device_showing("231", "on");
    s.dashboard
        .registry
        .register_control(&as_element(&control), &id("231"));
    s.dashboard.store.set(&id("231"), "on");

    let result = s.dashboard.dispatcher.toggle_control(&as_element(&control)).await;

    assert!(result.is_err());
    assert_eq!(control.shown().as_deref(), Some("on"));
    assert_eq!(s.dashboard.store.get(&id("231")).as_deref(), Some("on"));
    assert!(!s.dashboard.ledger.is_protected(&id("231")));
    assert_eq!(s.notices.messages().len(), 1);
}

/// Test: Clicking a control flips what the control shows
#[tokio::test]
async fn test_toggle_control_uses_displayed_state() {
    let s = session();
    let control = FakeElement::device_showing("231", "on");

    let next = s
        .dashboard
        .dispatcher
        .toggle_control(&as_element(&control))
        .await
        .unwrap();

    assert_eq!(next, "off");
    assert_eq!(s.transport.sent()[0].command, "off");
}

/// Test: Curtain controllers receive their own push ordinals
#[tokio::test]
async fn test_curtain_push_mapping() {
    let s = session();
    s.dashboard.dispatcher.curtain_action(&id("39"), "open").await.unwrap();
    s.dashboard.dispatcher.curtain_action(&id("40"), "open").await.unwrap();
    s.dashboard.dispatcher.curtain_action(&id("39"), "stop").await.unwrap();

    assert_eq!(
        s.transport.sent(),
        vec![
            CommandRequest::new(id("39"), "push").with_value("3"),
            CommandRequest::new(id("40"), "push").with_value("1"),
            CommandRequest::new(id("39"), "push").with_value("2"),
        ]
    );
    assert_eq!(s.dashboard.store.get_curtain(&id("39")), "open");
}

/// Test: Master toggle waits for every device and reverts only failures
#[tokio::test(start_paused = true)]
async fn test_master_toggle_all_settled() {
    let s = session();
    s.transport.make_unreachable("2");
    let master = FakeElement::master(&["1", "2", "3"], MasterKind::Lights);
    let master_el = as_element(&master);
    s.dashboard
        .registry
        .register_master(&master_el, &[id("1"), id("2"), id("3")], MasterKind::Lights);

    let run = {
        let dashboard = s.dashboard.clone();
        let master_el = master_el.clone();
        tokio::spawn(async move { dashboard.dispatcher.toggle_master(&master_el).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(master.is_pending());
    assert_eq!(master.shown().as_deref(), Some("on"));

    // A second click while busy is ignored.
    assert_eq!(s.dashboard.dispatcher.toggle_master(&master_el).await.unwrap(), None);

    let report = run.await.unwrap().unwrap().expect("report");
    assert_eq!(report.succeeded, vec![id("1"), id("3")]);
    assert_eq!(report.failed, vec![id("2")]);
    assert!(!master.is_pending());
    assert_eq!(s.dashboard.store.get(&id("2")).as_deref(), Some("off"));
    assert_eq!(master.shown().as_deref(), Some("on"));
    assert_eq!(s.transport.sent().len(), 3);
    assert_eq!(s.notices.messages().len(), 1);
}

/// Test: Curtain master opens every curtain when all are closed
#[tokio::test(start_paused = true)]
async fn test_curtain_master_opens_group() {
    let s = session();
    let master = FakeElement::master(&["39", "40"], MasterKind::Curtains);
    let master_el = as_element(&master);
    s.dashboard
        .registry
        .register_master(&master_el, &[id("39"), id("40")], MasterKind::Curtains);

    let report = s
        .dashboard
        .dispatcher
        .toggle_master(&master_el)
        .await
        .unwrap()
        .expect("report");

    assert_eq!(report.target, "open");
    let mut sent = s.transport.sent();
    sent.sort_by(|a, b| a.device.cmp(&b.device));
    assert_eq!(
        sent,
        vec![
            CommandRequest::new(id("39"), "push").with_value("3"),
            CommandRequest::new(id("40"), "push").with_value("1"),
        ]
    );
    assert_eq!(master.shown().as_deref(), Some("open"));
}

/// Test: A forced rescan during a group command keeps the master busy
#[tokio::test(start_paused = true)]
async fn test_rescan_keeps_master_pending() {
    let s = session();
    let page = FakeElement::container();
    let master = FakeElement::master(&["1", "3"], MasterKind::Lights);
    page.append(&master);
    let master_el = as_element(&master);
    s.dashboard.registry.prime(&as_element(&page), true);

    let run = {
        let dashboard = s.dashboard.clone();
        let master_el = master_el.clone();
        tokio::spawn(async move { dashboard.dispatcher.toggle_master(&master_el).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    s.dashboard.registry.prime(&as_element(&page), true);
    assert!(master.is_pending());
    assert!(s.dashboard.registry.is_master_pending(&master_el));
    assert_eq!(s.dashboard.dispatcher.toggle_master(&master_el).await.unwrap(), None);

    // Poll-driven refreshes leave the in-flight icon alone.
    let writes = master.writes();
    s.dashboard.store.set(&id("1"), "off");
    s.dashboard.store.set(&id("3"), "off");
    assert_eq!(s.dashboard.registry.refresh_masters(&s.dashboard.store, false), 0);
    assert_eq!(master.writes(), writes);

    run.await.unwrap().unwrap().expect("report");
    assert!(!master.is_pending());
    assert_eq!(s.transport.sent().len(), 2);
}

/// Test: Dropping a master toggle mid-settle releases the master
#[tokio::test(start_paused = true)]
async fn test_abandoned_master_toggle_clears_pending() {
    let s = session();
    let master = FakeElement::master(&["1", "2"], MasterKind::Lights);
    let master_el = as_element(&master);
    s.dashboard
        .registry
        .register_master(&master_el, &[id("1"), id("2")], MasterKind::Lights);

    let run = {
        let dashboard = s.dashboard.clone();
        let master_el = master_el.clone();
        tokio::spawn(async move { dashboard.dispatcher.toggle_master(&master_el).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(master.is_pending());

    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    assert!(!master.is_pending());
    assert!(!s.dashboard.registry.is_master_pending(&master_el));
    let report = s
        .dashboard
        .dispatcher
        .toggle_master(&master_el)
        .await
        .unwrap();
    assert!(report.is_some());
}
