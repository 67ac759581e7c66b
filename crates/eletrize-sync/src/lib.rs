//! # Eletrize Sync
//!
//! **Device-state reconciliation for the Eletrize home-automation dashboard**
//!
//! The dashboard shows lights, curtains and media devices controlled through a
//! Hubitat hub. This crate keeps what the dashboard displays in line with
//! what the hub reports while staying responsive to local clicks.
//!
//! ## Components
//!
//! - **State Store**: last known state per device, mirrored to durable
//!   storage, degrading to memory-only when storage is exhausted
//! - **Command Dispatcher**: optimistic commands with rollback, curtain
//!   mapping, group commands and cancellable command sequences
//! - **Control Registry**: weak index of on-screen controls by device
//! - **Poll Reconciler**: adaptive polling loop with protection windows
//! - **Aggregates**: OR-reduced state for master controls
//! - **Sync Scheduler**: coalesced re-sync after structural changes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eletrize_sync::{DashboardBuilder, HostCapabilities};
//!
//! # async fn run() -> eletrize_sync::Result<()> {
//! let dashboard = DashboardBuilder::new()
//!     .proxy_url("https://casa.example/hubitat-proxy")
//!     .polling_url("https://casa.example/polling")
//!     .tracked_devices(["231", "232", "110"])
//!     .capabilities(HostCapabilities::headless())
//!     .build()?;
//!
//! dashboard.start(None).await;
//! dashboard.dispatcher.toggle_device(&"231".into()).await?;
//! dashboard.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod models;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::*;

pub use crate::core::{
    AttributeObserver, Binding, CommandDispatcher, CommandLedger, CommandTransport,
    ControlRegistry, CycleReport, DurableStorage, Element, GroupReport, HostCapabilities,
    HubClient, InitializeReport, MemoryStorage, MutationObserver, MutationRecord, Notice,
    NoticeLevel, Notifier, PollReconciler, PollSource, PollerState, SqliteStorage, StateStore,
    SyncScheduler,
};

use crate::core::retry::{bounded, with_retry};
use crate::core::transport::{BeaconSink, WithBeaconFallback};

/// Outcome of the first load after start-up.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialLoad {
    /// States came from the hub.
    Hub {
        applied: usize,
        failed: Vec<DeviceId>,
    },
    /// The hub was unreachable; stored states (or defaults) are shown.
    Cached { error: Error },
}

/// One dashboard session.
///
/// Every component is an explicit instance shared through `Arc`, so several
/// sessions can coexist (tests run many side by side).
pub struct Dashboard {
    pub config: Arc<SyncConfig>,
    pub store: Arc<StateStore>,
    pub registry: Arc<ControlRegistry>,
    pub ledger: Arc<CommandLedger>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub reconciler: Arc<PollReconciler>,
    pub scheduler: Arc<SyncScheduler>,
    capabilities: HostCapabilities,
    source: Arc<dyn PollSource>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Dashboard {
    /// Observer for hosts with a mutation feed; `None` for hosts relying on
    /// the periodic rescan.
    pub fn mutation_observer(&self) -> Option<MutationObserver> {
        self.capabilities.mutation_observer.then(|| {
            MutationObserver::new(Arc::clone(&self.registry), Arc::clone(&self.scheduler))
        })
    }

    /// Prime the registry from `root`, load initial states, then start the
    /// scheduler and the poll loop.
    ///
    /// After a load served by the hub the first poll waits one base interval;
    /// after a cached fallback it runs right away.
    pub async fn start(&self, root: Option<Arc<dyn Element>>) -> InitialLoad {
        if let Some(root) = &root {
            self.registry.prime(root, false);
        }
        let load = self.load_initial_states().await;
        self.scheduler.start(root);
        match load {
            InitialLoad::Hub { .. } => self.reconciler.start_deferred(),
            InitialLoad::Cached { .. } => self.reconciler.start(),
        }
        load
    }

    /// Stop polling and the scheduler, waiting for their tasks to end.
    pub async fn shutdown(&self) {
        self.reconciler.shutdown().await;
        self.scheduler.stop().await;
        tracing::info!("Dashboard session stopped");
    }

    /// Fetch every tracked device once and render the result with `force`.
    ///
    /// A failed health check is only logged. If the fetch fails after
    /// retries, every control falls back to its stored state (or the default)
    /// and a connectivity notice is raised.
    pub async fn load_initial_states(&self) -> InitialLoad {
        let ids = self.config.tracked_devices.clone();
        let retry = &self.config.retry;

        if let Err(e) = self.source.health_check().await {
            tracing::warn!(error = %e, "Health check failed, loading anyway");
        }

        let fetched = with_retry(retry, "initial load", |_| {
            bounded(retry.request_timeout(), "initial load", self.source.fetch(&ids))
        })
        .await;

        match fetched {
            Ok(snapshot) => {
                let mut applied = 0;
                let mut failed = Vec::new();
                for (id, reading) in snapshot.iter() {
                    match reading {
                        Reading::Reported { state, .. } => {
                            self.store.set(id, state);
                            self.registry.apply_state(id, state, true);
                            applied += 1;
                        }
                        Reading::Failed { error } => {
                            tracing::warn!(device = %id, error = %error, "Device unreadable on load");
                            self.show_stored(id);
                            failed.push(id.clone());
                        }
                    }
                }
                self.registry.refresh_masters(&self.store, true);
                tracing::info!(applied, failed = failed.len(), "Initial states loaded");
                InitialLoad::Hub { applied, failed }
            }
            Err(error) => {
                tracing::error!(error = %error, "Initial load failed, showing stored states");
                for id in &ids {
                    self.show_stored(id);
                }
                self.registry.refresh_masters(&self.store, true);
                if let Some(notifier) = &self.notifier {
                    notifier.notify(Notice::warning(
                        "Hub unreachable. Showing last known states.",
                    ));
                }
                InitialLoad::Cached { error }
            }
        }
    }

    fn show_stored(&self, id: &DeviceId) {
        let state = self.store.state_or_default(id, DeviceClass::Switch);
        self.registry.apply_state(id, &state, true);
    }
}

/// Builder for a [`Dashboard`] session.
///
/// Without an explicit transport or poll source, a [`HubClient`] built from
/// the configuration is used for both.
///
/// # Example
///
/// ```rust,no_run
/// use eletrize_sync::DashboardBuilder;
///
/// let dashboard = DashboardBuilder::new()
///     .proxy_url("http://localhost:8788/hubitat-proxy")
///     .storage_dir("/var/lib/eletrize")
///     .build()
///     .expect("dashboard");
/// ```
#[derive(Default)]
pub struct DashboardBuilder {
    config: SyncConfig,
    capabilities: HostCapabilities,
    storage: Option<Arc<dyn DurableStorage>>,
    storage_dir: Option<std::path::PathBuf>,
    transport: Option<Arc<dyn CommandTransport>>,
    source: Option<Arc<dyn PollSource>>,
    notifier: Option<Arc<dyn Notifier>>,
    attributes: Option<Arc<dyn AttributeObserver>>,
}

impl DashboardBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.config.proxy_url = url.into();
        self
    }

    pub fn polling_url(mut self, url: impl Into<String>) -> Self {
        self.config.polling_url = url.into();
        self
    }

    /// Devices the poll loop asks the hub about.
    pub fn tracked_devices<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        self.config.tracked_devices = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Use `storage` as the durable backend.
    pub fn storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Keep durable state in a SQLite database inside `dir`.
    pub fn storage_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.storage_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn CommandTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn poll_source(mut self, source: Arc<dyn PollSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn attribute_observer(mut self, observer: Arc<dyn AttributeObserver>) -> Self {
        self.attributes = Some(observer);
        self
    }

    /// Validate the configuration and wire the session together.
    pub fn build(self) -> Result<Dashboard> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let store = match (self.storage, self.storage_dir) {
            (Some(storage), _) => StateStore::new(storage, &config.storage),
            (None, Some(dir)) => {
                let path = dir.join(&config.storage.database_file);
                StateStore::new(Arc::new(SqliteStorage::open(&path)?), &config.storage)
            }
            (None, None) => StateStore::memory_only(&config.storage),
        };
        let store = Arc::new(store);

        let (transport, source) = match (self.transport, self.source) {
            (Some(transport), Some(source)) => (transport, source),
            (transport, source) => {
                let hub = Arc::new(HubClient::new(&config)?);
                let transport = match transport {
                    Some(transport) => transport,
                    None if config.beacon_fallback => Arc::new(WithBeaconFallback::new(
                        hub.clone(),
                        hub.clone() as Arc<dyn BeaconSink>,
                    )) as Arc<dyn CommandTransport>,
                    None => hub.clone() as Arc<dyn CommandTransport>,
                };
                let source = source.unwrap_or_else(|| hub as Arc<dyn PollSource>);
                (transport, source)
            }
        };

        let registry = Arc::new(ControlRegistry::new());
        let ledger = Arc::new(CommandLedger::new(config.protection_window()));

        let mut dispatcher = CommandDispatcher::new(
            config.clone(),
            transport,
            store.clone(),
            registry.clone(),
            ledger.clone(),
        );
        let mut reconciler = PollReconciler::new(
            &config,
            source.clone(),
            store.clone(),
            registry.clone(),
            ledger.clone(),
        );
        if let Some(notifier) = &self.notifier {
            dispatcher = dispatcher.with_notifier(notifier.clone());
            reconciler = reconciler.with_notifier(notifier.clone());
        }
        if let Some(observer) = self.attributes {
            reconciler = reconciler.with_attribute_observer(observer);
        }

        let scheduler = SyncScheduler::new(
            &config.scheduler,
            self.capabilities,
            registry.clone(),
            store.clone(),
        );

        tracing::info!(
            devices = config.tracked_devices.len(),
            durable = store.is_durable(),
            "Dashboard session initialized"
        );

        Ok(Dashboard {
            config,
            store,
            registry,
            ledger,
            dispatcher: Arc::new(dispatcher),
            reconciler: Arc::new(reconciler),
            scheduler: Arc::new(scheduler),
            capabilities: self.capabilities,
            source,
            notifier: self.notifier,
        })
    }
}
