//! Command protection window.
//!
//! When a device is commanded locally, polls keep reporting its old state for
//! a while. The ledger remembers when each device was last commanded so the
//! reconciler can leave it alone until the hub catches up.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::DeviceId;

/// Per-device timestamp of the last local command.
pub struct CommandLedger {
    window: Duration,
    entries: Mutex<HashMap<DeviceId, Instant>>,
}

impl CommandLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Mark `id` as commanded now.
    pub fn record(&self, id: &DeviceId) {
        self.record_at(id, Instant::now());
    }

    pub fn record_all<'a>(&self, ids: impl IntoIterator<Item = &'a DeviceId>) {
        let now = Instant::now();
        if let Ok(mut entries) = self.entries.lock() {
            for id in ids {
                entries.insert(id.clone(), now);
            }
        }
    }

    pub fn record_at(&self, id: &DeviceId, at: Instant) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id.clone(), at);
        }
    }

    /// Drop the record, e.g. after a command failed and was reverted.
    pub fn clear(&self, id: &DeviceId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(id);
        }
    }

    pub fn is_protected(&self, id: &DeviceId) -> bool {
        self.is_protected_at(id, Instant::now())
    }

    /// True while `now` is inside `[commanded, commanded + window)`.
    pub fn is_protected_at(&self, id: &DeviceId, now: Instant) -> bool {
        self.remaining_at(id, now).is_some()
    }

    /// Time left in the window, if any.
    pub fn remaining_at(&self, id: &DeviceId, now: Instant) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        let at = entries.get(id)?;
        let elapsed = now.saturating_duration_since(*at);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    /// Physically remove expired records. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, at| now.saturating_duration_since(*at) < self.window);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(8))
    }
}
