//! Eletrize Core Modules
//!
//! Storage, transport and the reconciliation machinery.

pub mod aggregate;
pub mod dispatcher;
pub mod hooks;
pub mod network;
pub mod protection;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod state_store;
pub mod storage;
pub mod transport;

pub use aggregate::{aggregate_state, any_on, any_open};
pub use dispatcher::{
    CommandDispatcher, CommandSequence, GroupReport, InitializeReport, SequenceStep,
};
pub use hooks::{AttributeObserver, Notice, NoticeLevel, Notifier};
pub use network::HubClient;
pub use protection::CommandLedger;
pub use reconciler::{CycleOutcome, CycleReport, PollReconciler, PollerMachine, PollerState};
pub use registry::{Binding, ControlRegistry, Element, RegistrySnapshot};
pub use scheduler::{
    CoalesceStrategy, HostCapabilities, MutationObserver, MutationRecord, SyncScheduler,
};
pub use state_store::StateStore;
pub use storage::{DurableStorage, MemoryStorage, SqliteStorage};
pub use transport::{BeaconSink, CommandTransport, PollSource, WithBeaconFallback};
