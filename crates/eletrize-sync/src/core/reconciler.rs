//! Poll Reconciler
//!
//! Merges the hub's authoritative device states into the store and the
//! registry on an adaptive cadence.
//!
//! The cadence lives in [`PollerMachine`], a pure state machine with a single
//! [`PollerMachine::transition`] function. [`PollReconciler`] drives it on a
//! tokio task: it performs the fetches, applies results and sleeps for
//! whatever delay the machine asks for.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{CadenceConfig, SyncConfig};
use crate::error::Result;
use crate::models::{DeviceId, Reading, Snapshot};

use super::hooks::{AttributeObserver, Notice, Notifier};
use super::protection::CommandLedger;
use super::registry::ControlRegistry;
use super::retry::bounded;
use super::state_store::StateStore;
use super::transport::PollSource;

// ==================== State machine ====================

/// Where the poller is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    Polling { interval: Duration },
    BackingOff { interval: Duration, failures: u32 },
}

impl PollerState {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            PollerState::Stopped => None,
            PollerState::Polling { interval } | PollerState::BackingOff { interval, .. } => {
                Some(*interval)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, PollerState::Stopped)
    }
}

/// How a poll cycle went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// At least one device changed
    Changed,
    /// Fetch succeeded, nothing changed
    Quiescent,
    /// Transport or decode failure
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEvent {
    Start,
    /// Start with the first fetch one base interval away, after a fresh load.
    StartDeferred,
    Stop,
    Hidden,
    Visible,
    CycleCompleted { generation: u64, outcome: CycleOutcome },
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Fetch right away, tagged with the new generation.
    FetchNow { generation: u64 },
    /// Sleep, then fetch again within the same generation.
    Schedule { delay: Duration, generation: u64 },
    /// Cancel the pending timer.
    Cancel,
    /// Result belongs to a stopped generation; drop it.
    Discard,
    Nothing,
}

/// Cadence state machine.
///
/// Every start bumps the generation, so results of fetches issued before a
/// stop can be recognised and discarded.
#[derive(Debug, Clone)]
pub struct PollerMachine {
    cadence: CadenceConfig,
    state: PollerState,
    paused_for_visibility: bool,
    generation: u64,
}

impl PollerMachine {
    pub fn new(cadence: CadenceConfig) -> Self {
        Self {
            cadence,
            state: PollerState::Stopped,
            paused_for_visibility: false,
            generation: 0,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_paused_for_visibility(&self) -> bool {
        self.paused_for_visibility
    }

    /// Whether results tagged with `generation` may still be applied.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state.is_running() && generation == self.generation
    }

    pub fn transition(&mut self, event: PollerEvent) -> Directive {
        match event {
            PollerEvent::Start => {
                self.paused_for_visibility = false;
                self.begin()
            }
            PollerEvent::StartDeferred => {
                self.paused_for_visibility = false;
                match self.begin() {
                    Directive::FetchNow { generation } => Directive::Schedule {
                        delay: self.floored(self.base()),
                        generation,
                    },
                    other => other,
                }
            }
            PollerEvent::Stop => {
                self.paused_for_visibility = false;
                self.halt()
            }
            PollerEvent::Hidden => {
                if !self.state.is_running() {
                    return Directive::Nothing;
                }
                self.paused_for_visibility = true;
                self.halt()
            }
            PollerEvent::Visible => {
                if !self.paused_for_visibility {
                    return Directive::Nothing;
                }
                self.paused_for_visibility = false;
                self.begin()
            }
            PollerEvent::CycleCompleted {
                generation,
                outcome,
            } => {
                if !self.is_current(generation) {
                    return Directive::Discard;
                }
                self.state = self.next_state(outcome);
                let interval = self.state.interval().unwrap_or(self.base());
                Directive::Schedule {
                    delay: self.floored(interval),
                    generation,
                }
            }
        }
    }

    fn begin(&mut self) -> Directive {
        if self.state.is_running() {
            return Directive::Nothing;
        }
        self.generation += 1;
        self.state = PollerState::Polling {
            interval: self.base(),
        };
        Directive::FetchNow {
            generation: self.generation,
        }
    }

    fn halt(&mut self) -> Directive {
        if !self.state.is_running() {
            return Directive::Nothing;
        }
        self.generation += 1;
        self.state = PollerState::Stopped;
        Directive::Cancel
    }

    fn next_state(&self, outcome: CycleOutcome) -> PollerState {
        let current = self.state.interval().unwrap_or(self.base());
        let ceiling = Duration::from_millis(self.cadence.max_interval_ms);
        match outcome {
            CycleOutcome::Changed => PollerState::Polling {
                interval: self.base(),
            },
            CycleOutcome::Quiescent => PollerState::Polling {
                interval: (current + Duration::from_millis(self.cadence.step_ms)).min(ceiling),
            },
            CycleOutcome::Failed => {
                let failures = match self.state {
                    PollerState::BackingOff { failures, .. } => failures + 1,
                    _ => 1,
                };
                let grown = (current.as_millis() as f64 * self.cadence.error_multiplier).round();
                PollerState::BackingOff {
                    interval: Duration::from_millis(grown as u64).min(ceiling),
                    failures,
                }
            }
        }
    }

    fn base(&self) -> Duration {
        Duration::from_millis(self.cadence.base_interval_ms)
    }

    fn floored(&self, delay: Duration) -> Duration {
        delay.max(Duration::from_millis(self.cadence.min_delay_ms))
    }
}

// ==================== Driver ====================

/// What one applied snapshot did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub changed: Vec<DeviceId>,
    pub unchanged: Vec<DeviceId>,
    /// Skipped because a local command is still inside its protection window
    pub protected: Vec<DeviceId>,
    /// Reported as unreadable by the hub; last known state kept
    pub failed: Vec<DeviceId>,
}

impl CycleReport {
    pub fn outcome(&self) -> CycleOutcome {
        if self.changed.is_empty() {
            CycleOutcome::Quiescent
        } else {
            CycleOutcome::Changed
        }
    }
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background reconciliation loop.
pub struct PollReconciler {
    source: Arc<dyn PollSource>,
    store: Arc<StateStore>,
    registry: Arc<ControlRegistry>,
    ledger: Arc<CommandLedger>,
    tracked: Vec<DeviceId>,
    request_timeout: Duration,
    verbose: bool,
    machine: Mutex<PollerMachine>,
    running: Mutex<Option<RunningLoop>>,
    attributes: Option<Arc<dyn AttributeObserver>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PollReconciler {
    pub fn new(
        config: &SyncConfig,
        source: Arc<dyn PollSource>,
        store: Arc<StateStore>,
        registry: Arc<ControlRegistry>,
        ledger: Arc<CommandLedger>,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            ledger,
            tracked: config.tracked_devices.clone(),
            request_timeout: config.retry.request_timeout(),
            verbose: config.debug,
            machine: Mutex::new(PollerMachine::new(config.cadence.clone())),
            running: Mutex::new(None),
            attributes: None,
            notifier: None,
        }
    }

    pub fn with_attribute_observer(mut self, observer: Arc<dyn AttributeObserver>) -> Self {
        self.attributes = Some(observer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn machine(&self) -> MutexGuard<'_, PollerMachine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> PollerState {
        self.machine().state()
    }

    pub fn tracked_devices(&self) -> &[DeviceId] {
        &self.tracked
    }

    // ==================== Lifecycle ====================

    /// Start polling. The first fetch happens immediately.
    pub fn start(self: &Arc<Self>) {
        let directive = self.machine().transition(PollerEvent::Start);
        self.follow(directive);
    }

    /// Start polling with the first fetch one base interval away. Used right
    /// after a successful initial load so the hub is not asked twice.
    pub fn start_deferred(self: &Arc<Self>) {
        let directive = self.machine().transition(PollerEvent::StartDeferred);
        self.follow(directive);
    }

    /// Stop polling. A fetch already in flight completes but is not applied.
    pub fn stop(&self) {
        let directive = self.machine().transition(PollerEvent::Stop);
        self.follow_stop(directive);
    }

    /// Pause while the dashboard is hidden, resume when it is shown again.
    pub fn set_visible(self: &Arc<Self>, visible: bool) {
        let event = if visible {
            PollerEvent::Visible
        } else {
            PollerEvent::Hidden
        };
        let directive = self.machine().transition(event);
        self.follow(directive);
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let running = self.running_slot().take();
        if let Some(running) = running {
            running.token.cancel();
            let _ = running.handle.await;
        }
    }

    fn running_slot(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn follow(self: &Arc<Self>, directive: Directive) {
        match directive {
            Directive::FetchNow { generation } => self.spawn_loop(generation, None),
            Directive::Schedule { delay, generation } => {
                self.spawn_loop(generation, Some(delay))
            }
            other => self.follow_stop(other),
        }
    }

    fn follow_stop(&self, directive: Directive) {
        if directive == Directive::Cancel {
            if let Some(running) = self.running_slot().as_ref() {
                running.token.cancel();
            }
            tracing::info!("Polling stopped");
        }
    }

    fn spawn_loop(self: &Arc<Self>, generation: u64, first_delay: Option<Duration>) {
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            if let Some(delay) = first_delay {
                tokio::select! {
                    _ = loop_token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            this.run_loop(generation, loop_token).await
        });

        let previous = self.running_slot().replace(RunningLoop { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        tracing::info!(devices = self.tracked.len(), "Polling started");
    }

    async fn run_loop(&self, generation: u64, token: CancellationToken) {
        loop {
            let result = bounded(
                self.request_timeout,
                "poll",
                self.source.fetch(&self.tracked),
            )
            .await;

            match self.complete_cycle(generation, result) {
                Directive::Schedule { delay, .. } => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                _ => break,
            }
        }
    }

    /// Apply a finished fetch if its generation is still live, then advance
    /// the cadence.
    ///
    /// The machine lock is never held while host code runs: snapshots are
    /// applied and notices sent with the guard released.
    fn complete_cycle(&self, generation: u64, result: Result<Snapshot>) -> Directive {
        if !self.machine().is_current(generation) {
            tracing::debug!(generation, "Discarding poll result after stop");
            return Directive::Discard;
        }

        let outcome = match result {
            Ok(snapshot) => {
                let report = self.apply_snapshot(&snapshot);
                self.log_cycle(&report);
                report.outcome()
            }
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "Poll failed");
                CycleOutcome::Failed
            }
        };

        // A stop during apply bumped the generation; the transition discards.
        let (directive, state) = {
            let mut machine = self.machine();
            let directive = machine.transition(PollerEvent::CycleCompleted {
                generation,
                outcome,
            });
            (directive, machine.state())
        };

        if directive == Directive::Discard {
            tracing::debug!(generation, "Poller stopped while applying results");
            return directive;
        }
        if let PollerState::BackingOff { interval, failures } = state {
            tracing::debug!(interval_ms = interval.as_millis() as u64, failures, "Poll backing off");
            if failures == 1 {
                self.notify(Notice::warning("Connection to the hub is unstable"));
            }
        }
        directive
    }

    fn log_cycle(&self, report: &CycleReport) {
        if self.verbose {
            tracing::debug!(
                changed = report.changed.len(),
                protected = report.protected.len(),
                failed = report.failed.len(),
                "Poll cycle applied"
            );
        } else {
            tracing::trace!(
                changed = report.changed.len(),
                protected = report.protected.len(),
                failed = report.failed.len(),
                "Poll cycle applied"
            );
        }
    }

    // ==================== Reconciliation ====================

    /// Fetch and apply once, outside the cadence loop.
    pub async fn poll_once(&self) -> Result<CycleReport> {
        let snapshot = bounded(
            self.request_timeout,
            "poll",
            self.source.fetch(&self.tracked),
        )
        .await?;
        Ok(self.apply_snapshot(&snapshot))
    }

    /// Merge `snapshot` into the store and the registry.
    ///
    /// Devices inside their protection window are left untouched. Failed
    /// readings keep their last known state.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> CycleReport {
        let mut report = CycleReport::default();

        for (id, reading) in snapshot.iter() {
            let (state, attributes) = match reading {
                Reading::Reported { state, attributes } => (state, attributes),
                Reading::Failed { error } => {
                    tracing::warn!(device = %id, error = %error, "Hub could not read device");
                    report.failed.push(id.clone());
                    continue;
                }
            };

            if self.ledger.is_protected(id) {
                tracing::trace!(device = %id, "Skipping poll update inside protection window");
                report.protected.push(id.clone());
                continue;
            }

            if self.store.get(id).as_deref() != Some(state.as_str()) {
                self.store.set(id, state);
                report.changed.push(id.clone());
            } else {
                report.unchanged.push(id.clone());
            }
            self.registry.apply_state(id, state, false);

            if !attributes.is_empty() {
                if let Some(observer) = &self.attributes {
                    observer.on_attributes(id, attributes);
                }
            }
        }

        self.registry.refresh_masters(&self.store, false);
        self.ledger.cleanup_expired();
        report
    }

    fn notify(&self, notice: Notice) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notice);
        }
    }
}
