//! Shared fakes for the integration flows: an element tree, scripted
//! transports and a local HTTP hub.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde_json::Value;

use eletrize_sync::config::{RetryPolicy, SyncConfig};
use eletrize_sync::{
    Binding, CommandRequest, CommandTransport, DeviceId, Element, Error, MasterKind, Notice,
    Notifier, PollSource, Result, Snapshot,
};

// ==================== Element tree ====================

/// In-memory stand-in for an on-screen element.
pub struct FakeElement {
    binding: Binding,
    connected: AtomicBool,
    shown: Mutex<Option<String>>,
    writes: AtomicUsize,
    pending: AtomicBool,
    kids: Mutex<Vec<Arc<dyn Element>>>,
}

impl FakeElement {
    fn new(binding: Binding) -> Arc<Self> {
        Arc::new(Self {
            binding,
            connected: AtomicBool::new(true),
            shown: Mutex::new(None),
            writes: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            kids: Mutex::new(Vec::new()),
        })
    }

    pub fn device(id: &str) -> Arc<Self> {
        Self::new(Binding::Device(DeviceId::from(id)))
    }

    /// Device control that already displays `state`.
    pub fn device_showing(id: &str, state: &str) -> Arc<Self> {
        let el = Self::device(id);
        *el.shown.lock().unwrap() = Some(state.to_string());
        el
    }

    pub fn master(ids: &[&str], kind: MasterKind) -> Arc<Self> {
        Self::new(Binding::Master {
            ids: ids.iter().map(|s| DeviceId::from(*s)).collect(),
            kind,
        })
    }

    pub fn container() -> Arc<Self> {
        Self::new(Binding::None)
    }

    pub fn append(&self, child: &Arc<FakeElement>) {
        self.kids.lock().unwrap().push(child.clone());
    }

    pub fn shown(&self) -> Option<String> {
        self.shown.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Element for FakeElement {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn binding(&self) -> Binding {
        self.binding.clone()
    }

    fn displayed_state(&self) -> Option<String> {
        self.shown()
    }

    fn render_state(&self, state: &str) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.shown.lock().unwrap() = Some(state.to_string());
    }

    fn children(&self) -> Vec<Arc<dyn Element>> {
        self.kids.lock().unwrap().clone()
    }

    fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }
}

pub fn as_element(el: &Arc<FakeElement>) -> Arc<dyn Element> {
    el.clone()
}

pub fn id(s: &str) -> DeviceId {
    DeviceId::from(s)
}

// ==================== Transports ====================

/// Records every command; fails for ids marked unreachable.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<CommandRequest>>,
    unreachable: Mutex<BTreeSet<String>>,
    delay: Option<Duration>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport whose replies take `delay` to arrive.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn make_unreachable(&self, id: &str) {
        self.unreachable.lock().unwrap().insert(id.to_string());
    }

    pub fn sent(&self) -> Vec<CommandRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandTransport for FakeTransport {
    async fn send(&self, request: &CommandRequest) -> Result<Option<Value>> {
        self.sent.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().unwrap().contains(request.device.as_str()) {
            return Err(Error::network("device unreachable"));
        }
        Ok(Some(serde_json::json!({ "status": "ok" })))
    }
}

/// Replays queued poll replies, then repeats a fallback snapshot.
#[derive(Default)]
pub struct ScriptedSource {
    replies: Mutex<VecDeque<Result<Snapshot>>>,
    fallback: Mutex<Snapshot>,
    calls: AtomicUsize,
    healthy: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        let source = Self::default();
        source.healthy.store(true, Ordering::SeqCst);
        Arc::new(source)
    }

    pub fn push(&self, reply: Result<Snapshot>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn set_fallback(&self, snapshot: Snapshot) {
        *self.fallback.lock().unwrap() = snapshot;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollSource for ScriptedSource {
    async fn fetch(&self, _ids: &[DeviceId]) -> Result<Snapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.replies.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(self.fallback.lock().unwrap().clone()))
    }

    async fn health_check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::network("health probe refused"))
        }
    }
}

#[derive(Default)]
pub struct CollectingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl CollectingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.message.clone())
            .collect()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

// ==================== Fake hub ====================

#[derive(Default)]
struct HubState {
    commands: Mutex<Vec<HashMap<String, String>>>,
    command_failure: Mutex<Option<(u16, String)>>,
    poll_reply: Mutex<(u16, String)>,
    poll_queries: Mutex<Vec<HashMap<String, String>>>,
    health_hits: AtomicUsize,
}

/// Local HTTP server speaking the proxy and polling endpoints.
pub struct FakeHub {
    base: String,
    state: Arc<HubState>,
}

impl FakeHub {
    pub async fn spawn() -> Self {
        let state = Arc::new(HubState {
            poll_reply: Mutex::new((200, r#"{"devices":{}}"#.to_string())),
            ..HubState::default()
        });

        let app = Router::new()
            .route("/hubitat-proxy", get(proxy))
            .route("/polling", get(polling))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake hub");
        let addr = listener.local_addr().expect("fake hub address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base: format!("http://{}", addr),
            state,
        }
    }

    pub fn proxy_url(&self) -> String {
        format!("{}/hubitat-proxy", self.base)
    }

    pub fn polling_url(&self) -> String {
        format!("{}/polling", self.base)
    }

    /// Configuration pointing at this hub, with fast retries.
    pub fn config(&self) -> SyncConfig {
        SyncConfig {
            proxy_url: self.proxy_url(),
            polling_url: self.polling_url(),
            beacon_fallback: false,
            retry: RetryPolicy {
                base_delay_ms: 10,
                max_delay_ms: 20,
                request_timeout_ms: 2_000,
                health_check_timeout_ms: 1_000,
                ..RetryPolicy::default()
            },
            ..SyncConfig::default()
        }
    }

    pub fn reply_to_polls(&self, status: u16, body: &str) {
        *self.state.poll_reply.lock().unwrap() = (status, body.to_string());
    }

    pub fn fail_commands(&self, status: u16, body: &str) {
        *self.state.command_failure.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn commands(&self) -> Vec<HashMap<String, String>> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn poll_queries(&self) -> Vec<HashMap<String, String>> {
        self.state.poll_queries.lock().unwrap().clone()
    }

    pub fn health_hits(&self) -> usize {
        self.state.health_hits.load(Ordering::SeqCst)
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn proxy(
    State(hub): State<Arc<HubState>>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    hub.commands.lock().unwrap().push(query);
    match hub.command_failure.lock().unwrap().clone() {
        Some((code, body)) => (status(code), body),
        None => (StatusCode::OK, r#"{"status":"ok"}"#.to_string()),
    }
}

async fn polling(
    State(hub): State<Arc<HubState>>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    if query.contains_key("health") {
        hub.health_hits.fetch_add(1, Ordering::SeqCst);
        return (StatusCode::OK, "ok".to_string());
    }
    hub.poll_queries.lock().unwrap().push(query);
    let (code, body) = hub.poll_reply.lock().unwrap().clone();
    (status(code), body)
}

/// Poll `check` every few milliseconds until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
