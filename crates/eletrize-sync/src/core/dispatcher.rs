//! Command Dispatcher
//!
//! Sends device commands to the hub and keeps the local view optimistic:
//! the store and every control show the target state immediately, the
//! protection ledger shields them from stale polls, and a command that was
//! not delivered is rolled back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    state, CommandRequest, CurtainAction, CurtainCommand, DeviceClass, DeviceId, MasterKind,
};

use super::aggregate::aggregate_state;
use super::hooks::{Notice, Notifier};
use super::protection::CommandLedger;
use super::registry::{Binding, ControlRegistry, Element};
use super::state_store::StateStore;
use super::transport::CommandTransport;

/// One step of a multi-command sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    pub command: String,
    pub value: Option<String>,
}

impl SequenceStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            value: None,
        }
    }
}

/// Ordered commands for one device, sent with a fixed spacing.
#[derive(Debug, Clone)]
pub struct CommandSequence {
    pub steps: Vec<SequenceStep>,
    pub spacing: Duration,
}

impl CommandSequence {
    pub fn new(steps: Vec<SequenceStep>, spacing: Duration) -> Self {
        Self { steps, spacing }
    }

    /// Digit-by-digit channel tuning, e.g. `"267"` becomes `num2`, `num6`, `num7`.
    pub fn channel(number: &str, spacing: Duration) -> Result<Self> {
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!("Invalid channel number: {}", number)));
        }
        let steps = number
            .chars()
            .map(|d| SequenceStep::new(format!("num{}", d)))
            .collect();
        Ok(Self::new(steps, spacing))
    }
}

/// Result of a group command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub target: String,
    pub succeeded: Vec<DeviceId>,
    pub failed: Vec<DeviceId>,
}

/// Result of the startup `initialize` sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitializeReport {
    pub initialized: usize,
    pub failed: usize,
}

struct ActiveSequence {
    generation: u64,
    token: CancellationToken,
}

/// Clears a master's pending flag when dropped, including when the toggle
/// future itself is dropped mid-settle.
struct PendingMaster<'a> {
    registry: &'a ControlRegistry,
    element: &'a Arc<dyn Element>,
}

impl Drop for PendingMaster<'_> {
    fn drop(&mut self) {
        self.registry.set_master_pending(self.element, false);
    }
}

/// Optimistic command front-end over a [`CommandTransport`].
pub struct CommandDispatcher {
    config: Arc<SyncConfig>,
    transport: Arc<dyn CommandTransport>,
    store: Arc<StateStore>,
    registry: Arc<ControlRegistry>,
    ledger: Arc<CommandLedger>,
    notifier: Option<Arc<dyn Notifier>>,
    sequences: Mutex<(u64, HashMap<DeviceId, ActiveSequence>)>,
}

impl CommandDispatcher {
    pub fn new(
        config: Arc<SyncConfig>,
        transport: Arc<dyn CommandTransport>,
        store: Arc<StateStore>,
        registry: Arc<ControlRegistry>,
        ledger: Arc<CommandLedger>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            registry,
            ledger,
            notifier: None,
            sequences: Mutex::new((0, HashMap::new())),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    // ==================== Raw commands ====================

    /// Send one command and mark the device as recently commanded.
    ///
    /// `Ok(None)` means the hub accepted the command but its reply was unreadable.
    pub async fn send_command(
        &self,
        id: &DeviceId,
        command: &str,
        value: Option<&str>,
    ) -> Result<Option<Value>> {
        self.ledger.record(id);
        let mut request = CommandRequest::new(id.clone(), command);
        if let Some(v) = value {
            request = request.with_value(v);
        }
        self.deliver(&request).await
    }

    async fn deliver(&self, request: &CommandRequest) -> Result<Option<Value>> {
        match self.transport.send(request).await {
            Ok(reply) => {
                tracing::debug!(request = %request, readable = reply.is_some(), "Command delivered");
                Ok(reply)
            }
            Err(e) => {
                tracing::error!(request = %request, error = %e, "Command not delivered");
                Err(e)
            }
        }
    }

    // ==================== Switches ====================

    /// Drive a switch device to `target` optimistically, reverting on failure.
    pub async fn set_device_state(&self, id: &DeviceId, target: &str) -> Result<Option<Value>> {
        let previous = self.store.state_or_default(id, DeviceClass::Switch);

        self.ledger.record(id);
        self.store.set(id, target);
        self.registry.apply_state(id, target, false);
        self.registry.refresh_masters(&self.store, false);

        let request = CommandRequest::new(id.clone(), target);
        match self.deliver(&request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.revert_switch(id, &previous);
                self.notify(Notice::error(format!(
                    "Could not reach device {}; change reverted",
                    id
                )));
                Err(e)
            }
        }
    }

    /// Flip a switch device based on its stored state. Returns the new state.
    pub async fn toggle_device(&self, id: &DeviceId) -> Result<String> {
        let current = self.store.state_or_default(id, DeviceClass::Switch);
        let target = state::toggled(&current);
        self.set_device_state(id, target).await?;
        Ok(target.to_string())
    }

    /// Flip the device behind a clicked control, using what that control shows.
    pub async fn toggle_control(&self, control: &Arc<dyn Element>) -> Result<String> {
        let Binding::Device(id) = control.binding() else {
            return Err(Error::InvalidInput("element is not bound to a device".into()));
        };
        let shown = control
            .displayed_state()
            .unwrap_or_else(|| state::OFF.to_string());
        let target = state::toggled(&shown);
        self.set_device_state(&id, target).await?;
        Ok(target.to_string())
    }

    fn revert_switch(&self, id: &DeviceId, previous: &str) {
        self.ledger.clear(id);
        self.store.set(id, previous);
        self.registry.apply_state(id, previous, false);
        self.registry.refresh_masters(&self.store, false);
    }

    // ==================== Curtains ====================

    /// Resolve a curtain command to the request the controller understands.
    ///
    /// Cloud-routed curtains take named commands; local controllers take
    /// `push` with an ordinal from the device's mapping. `pushN` passes through.
    pub fn curtain_request(&self, id: &DeviceId, command: CurtainCommand) -> CommandRequest {
        match command {
            CurtainCommand::Push(n) => CommandRequest::new(id.clone(), format!("push{}", n)),
            CurtainCommand::Action(action) if self.config.is_cloud_device(id) => {
                CommandRequest::new(id.clone(), action.as_str())
            }
            CurtainCommand::Action(action) => {
                let ordinal = self.config.curtain_mapping(id).ordinal(action);
                CommandRequest::new(id.clone(), "push").with_value(ordinal.to_string())
            }
        }
    }

    /// Send a curtain action (`open`, `stop`, `close` or `pushN`).
    pub async fn curtain_action(&self, id: &DeviceId, command: &str) -> Result<Option<Value>> {
        let command: CurtainCommand = command.parse()?;
        let request = self.curtain_request(id, command);

        let previous = self.store.get_curtain(id);
        let position = match command {
            CurtainCommand::Action(a) => state::curtain_state_for(a.as_str()),
            CurtainCommand::Push(_) => None,
        };

        self.ledger.record(id);
        if let Some(position) = position {
            self.store.set_curtain(id, position);
            self.registry.refresh_masters(&self.store, false);
        }

        match self.deliver(&request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.ledger.clear(id);
                if position.is_some() {
                    self.store.set_curtain(id, &previous);
                    self.registry.refresh_masters(&self.store, false);
                }
                self.notify(Notice::error(format!("Curtain {} did not respond", id)));
                Err(e)
            }
        }
    }

    // ==================== Groups ====================

    /// Switch every device in `ids` to `target` concurrently.
    ///
    /// Waits for all commands to settle; a failure reverts only its device.
    pub async fn group_switch(&self, ids: &[DeviceId], target: &str) -> GroupReport {
        self.ledger.record_all(ids);
        let previous: Vec<String> = ids
            .iter()
            .map(|id| self.store.state_or_default(id, DeviceClass::Switch))
            .collect();
        for id in ids {
            self.store.set(id, target);
            self.registry.apply_state(id, target, false);
        }

        let results = join_all(ids.iter().map(|id| {
            let request = CommandRequest::new(id.clone(), target);
            async move { self.deliver(&request).await }
        }))
        .await;

        let mut report = GroupReport {
            target: target.to_string(),
            ..Default::default()
        };
        for ((id, prev), result) in ids.iter().zip(previous).zip(results) {
            match result {
                Ok(_) => report.succeeded.push(id.clone()),
                Err(_) => {
                    self.ledger.clear(id);
                    self.store.set(id, &prev);
                    self.registry.apply_state(id, &prev, false);
                    report.failed.push(id.clone());
                }
            }
        }
        report
    }

    /// Send `action` to every curtain in `ids` concurrently.
    pub async fn group_curtain(&self, ids: &[DeviceId], action: CurtainAction) -> GroupReport {
        let results = join_all(
            ids.iter()
                .map(|id| self.curtain_action(id, action.as_str())),
        )
        .await;

        let mut report = GroupReport {
            target: action.as_str().to_string(),
            ..Default::default()
        };
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(_) => report.succeeded.push(id.clone()),
                Err(_) => report.failed.push(id.clone()),
            }
        }
        report
    }

    /// Toggle a registered master control.
    ///
    /// Returns `Ok(None)` if the master is still busy with a previous command.
    /// The pending flag stays set until every command has settled plus the
    /// configured settle delay.
    pub async fn toggle_master(&self, master: &Arc<dyn Element>) -> Result<Option<GroupReport>> {
        let Binding::Master { ids, kind } = master.binding() else {
            return Err(Error::InvalidInput("element is not a master control".into()));
        };
        if ids.is_empty() {
            return Err(Error::InvalidInput("master control has no devices".into()));
        }
        if !self.registry.claim_master(master) {
            tracing::debug!("Master control busy, ignoring toggle");
            return Ok(None);
        }
        let pending = PendingMaster {
            registry: &self.registry,
            element: master,
        };

        let current = aggregate_state(&self.store, &ids, kind);

        let report = match kind {
            MasterKind::Lights => {
                let target = state::toggled(current);
                master.render_state(target);
                self.group_switch(&ids, target).await
            }
            MasterKind::Curtains => {
                let (action, shown) = if current == state::OPEN {
                    (CurtainAction::Close, state::CLOSED)
                } else {
                    (CurtainAction::Open, state::OPEN)
                };
                master.render_state(shown);
                self.group_curtain(&ids, action).await
            }
        };

        tokio::time::sleep(self.config.master_settle()).await;
        drop(pending);
        self.registry.refresh_masters(&self.store, false);

        if !report.failed.is_empty() {
            self.notify(Notice::warning(format!(
                "{} of {} devices did not respond",
                report.failed.len(),
                ids.len()
            )));
        }
        Ok(Some(report))
    }

    // ==================== Sequences ====================

    /// Run `sequence` against `id`, cancelling any sequence already running
    /// for that device before the first step is sent. Returns steps sent.
    pub async fn run_sequence(&self, id: &DeviceId, sequence: CommandSequence) -> Result<usize> {
        let (generation, token) = self.begin_sequence(id);
        let result = self.drive_sequence(id, &sequence, &token).await;
        self.end_sequence(id, generation);
        result
    }

    /// Cancel whatever sequence is running for `id`.
    pub fn cancel_sequence(&self, id: &DeviceId) -> bool {
        let Ok(mut guard) = self.sequences.lock() else {
            return false;
        };
        match guard.1.remove(id) {
            Some(active) => {
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin_sequence(&self, id: &DeviceId) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        let mut guard = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.0 += 1;
        let generation = guard.0;
        let previous = guard.1.insert(
            id.clone(),
            ActiveSequence {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(device = %id, "Cancelling previous command sequence");
            previous.token.cancel();
        }
        (generation, token)
    }

    fn end_sequence(&self, id: &DeviceId, generation: u64) {
        if let Ok(mut guard) = self.sequences.lock() {
            if guard.1.get(id).is_some_and(|a| a.generation == generation) {
                guard.1.remove(id);
            }
        }
    }

    async fn drive_sequence(
        &self,
        id: &DeviceId,
        sequence: &CommandSequence,
        token: &CancellationToken,
    ) -> Result<usize> {
        let mut sent = 0;
        for (index, step) in sequence.steps.iter().enumerate() {
            if token.is_cancelled() {
                return Err(Error::Cancelled(format!("sequence for {} superseded", id)));
            }
            if index > 0 {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(Error::Cancelled(format!("sequence for {} superseded", id)));
                    }
                    _ = tokio::time::sleep(sequence.spacing) => {}
                }
            }
            self.send_command(id, &step.command, step.value.as_deref())
                .await?;
            sent += 1;
        }
        Ok(sent)
    }

    // ==================== Initialization ====================

    /// Send `initialize` to every configured device in spaced batches.
    ///
    /// `progress` is called after each batch with (done, total).
    pub async fn initialize_devices(
        &self,
        progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> InitializeReport {
        let ids = &self.config.devices_with_initialize;
        let batch_size = self.config.initialize.batch_size.max(1);
        let delay = Duration::from_millis(self.config.initialize.batch_delay_ms);
        let total = ids.len();
        let mut report = InitializeReport::default();

        tracing::info!(total, batch_size, "Initializing devices");
        for (index, batch) in ids.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(delay).await;
            }
            let results = join_all(batch.iter().map(|id| {
                let request = CommandRequest::new(id.clone(), "initialize");
                async move { self.transport.send(&request).await }
            }))
            .await;

            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(_) => report.initialized += 1,
                    Err(e) => {
                        tracing::warn!(device = %id, error = %e, "Device initialize failed");
                        report.failed += 1;
                    }
                }
            }
            if let Some(progress) = progress {
                progress(report.initialized + report.failed, total);
            }
        }

        tracing::info!(
            initialized = report.initialized,
            failed = report.failed,
            "Device initialization finished"
        );
        report
    }

    fn notify(&self, notice: Notice) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notice);
        }
    }
}
