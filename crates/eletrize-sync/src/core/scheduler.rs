//! Mutation Observer / Sync Scheduler
//!
//! Structural changes to the host's element tree (navigation inserting a new
//! page of controls) arrive as batches of [`MutationRecord`]s. The observer
//! keeps the registry current incrementally and asks the [`SyncScheduler`]
//! for a single coalesced sync pass instead of re-rendering per mutation.
//!
//! Hosts without a mutation feed fall back to a periodic full rescan.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;

use super::registry::{Binding, ControlRegistry, Element};
use super::state_store::StateStore;

/// What the host runtime can offer the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub idle_callback: bool,
    pub animation_frame: bool,
    pub mutation_observer: bool,
}

impl HostCapabilities {
    /// A full browser-like host.
    pub fn full() -> Self {
        Self {
            idle_callback: true,
            animation_frame: true,
            mutation_observer: true,
        }
    }

    /// No callbacks at all; only timers.
    pub fn headless() -> Self {
        Self::default()
    }
}

/// How pending sync requests are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceStrategy {
    /// Wait for idle, bounded by a timeout
    Idle(Duration),
    /// Next animation frame
    Frame(Duration),
    /// Plain short timer
    Timer(Duration),
}

impl CoalesceStrategy {
    /// Prefer idle callbacks, then animation frames, then a timer.
    pub fn select(caps: HostCapabilities, config: &SchedulerConfig) -> Self {
        if caps.idle_callback {
            CoalesceStrategy::Idle(Duration::from_millis(config.idle_timeout_ms))
        } else if caps.animation_frame {
            CoalesceStrategy::Frame(Duration::from_millis(config.frame_delay_ms))
        } else {
            CoalesceStrategy::Timer(Duration::from_millis(config.timer_delay_ms))
        }
    }

    pub fn delay(&self) -> Duration {
        match self {
            CoalesceStrategy::Idle(d) | CoalesceStrategy::Frame(d) | CoalesceStrategy::Timer(d) => *d,
        }
    }
}

/// One batch entry from the host's mutation feed.
#[derive(Clone, Default)]
pub struct MutationRecord {
    pub added: Vec<Arc<dyn Element>>,
    pub removed: Vec<Arc<dyn Element>>,
}

/// Whether `node` is a control or contains one.
fn is_relevant(node: &Arc<dyn Element>) -> bool {
    node.binding() != Binding::None || node.children().iter().any(is_relevant)
}

struct Tasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Coalesces sync requests into single registry passes.
pub struct SyncScheduler {
    registry: Arc<ControlRegistry>,
    store: Arc<StateStore>,
    strategy: CoalesceStrategy,
    fallback_interval: Option<Duration>,
    requests: mpsc::Sender<()>,
    receiver: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: Mutex<Option<Tasks>>,
    passes: AtomicUsize,
}

impl SyncScheduler {
    pub fn new(
        config: &SchedulerConfig,
        caps: HostCapabilities,
        registry: Arc<ControlRegistry>,
        store: Arc<StateStore>,
    ) -> Self {
        // Capacity one: a request while one is queued is already covered.
        let (requests, receiver) = mpsc::channel(1);
        let fallback_interval =
            (!caps.mutation_observer).then(|| Duration::from_millis(config.fallback_resync_ms));
        Self {
            registry,
            store,
            strategy: CoalesceStrategy::select(caps, config),
            fallback_interval,
            requests,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(None),
            passes: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> CoalesceStrategy {
        self.strategy
    }

    /// Interval of the periodic rescan, if the host has no mutation feed.
    pub fn fallback_interval(&self) -> Option<Duration> {
        self.fallback_interval
    }

    /// Sync passes run so far.
    pub fn pass_count(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }

    fn tasks(&self) -> MutexGuard<'_, Option<Tasks>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the coalescing worker, plus the periodic rescan of `root` when
    /// the host cannot report mutations.
    pub fn start(self: &Arc<Self>, root: Option<Arc<dyn Element>>) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(receiver) = receiver else {
            tracing::debug!("Sync scheduler already started");
            return;
        };

        let token = CancellationToken::new();
        let mut handles = Vec::new();

        let this = Arc::clone(self);
        let worker_token = token.clone();
        handles.push(tokio::spawn(async move {
            this.run_worker(receiver, worker_token).await
        }));

        if let (Some(interval), Some(root)) = (self.fallback_interval, root) {
            let this = Arc::clone(self);
            let resync_token = token.clone();
            handles.push(tokio::spawn(async move {
                this.run_fallback(interval, root, resync_token).await
            }));
        }

        tracing::debug!(strategy = ?self.strategy, "Sync scheduler started");
        *self.tasks() = Some(Tasks { token, handles });
    }

    pub async fn stop(&self) {
        let tasks = self.tasks().take();
        if let Some(tasks) = tasks {
            tasks.token.cancel();
            for handle in tasks.handles {
                let _ = handle.await;
            }
        }
    }

    /// Ask for a sync pass. Returns `false` if one was already pending.
    pub fn schedule(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Sync requested after scheduler stopped");
                false
            }
        }
    }

    /// Run a sync pass right away.
    pub fn sync_now(&self) -> usize {
        let writes = self.registry.sync_all(&self.store, false);
        self.passes.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(writes, "Sync pass");
        writes
    }

    async fn run_worker(&self, mut receiver: mpsc::Receiver<()>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                request = receiver.recv() => {
                    if request.is_none() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.strategy.delay()) => {}
            }
            while receiver.try_recv().is_ok() {}
            self.sync_now();
        }
    }

    async fn run_fallback(&self, interval: Duration, root: Arc<dyn Element>, token: CancellationToken) {
        tracing::debug!(
            interval_ms = interval.as_millis() as u64,
            "No mutation feed, rescanning periodically"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.registry.prime(&root, true);
            self.sync_now();
        }
    }
}

/// Feeds mutation batches into the registry and the scheduler.
pub struct MutationObserver {
    registry: Arc<ControlRegistry>,
    scheduler: Arc<SyncScheduler>,
}

impl MutationObserver {
    pub fn new(registry: Arc<ControlRegistry>, scheduler: Arc<SyncScheduler>) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    /// Handle one batch. Returns whether a sync pass was requested.
    pub fn on_mutations(&self, records: &[MutationRecord]) -> bool {
        let mut relevant = false;
        for record in records {
            for node in record.removed.iter().filter(|n| is_relevant(n)) {
                self.registry.remove_from_node(node);
                relevant = true;
            }
            for node in record.added.iter().filter(|n| is_relevant(n)) {
                self.registry.collect_from_node(node);
                relevant = true;
            }
        }
        if relevant {
            self.scheduler.schedule();
        }
        relevant
    }
}
