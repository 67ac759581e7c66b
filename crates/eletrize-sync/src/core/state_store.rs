//! Persisted State Store
//!
//! Last-known state per device. Every write lands in an in-memory mirror
//! first and is then copied to durable storage. Durable failures never reach
//! callers: a full store is purged once and retried once, and if that does not
//! help the session continues memory-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::StorageConfig;
use crate::error::Error;
use crate::models::{state, DeviceClass, DeviceId};

use super::storage::DurableStorage;

/// Device state cache with durable write-through.
pub struct StateStore {
    memory: Mutex<HashMap<String, String>>,
    durable: Option<Arc<dyn DurableStorage>>,
    durable_enabled: AtomicBool,
    purge_attempted: AtomicBool,
    key_prefix: String,
    curtain_prefix: String,
}

impl StateStore {
    /// Store backed by `durable`.
    pub fn new(durable: Arc<dyn DurableStorage>, layout: &StorageConfig) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            durable: Some(durable),
            durable_enabled: AtomicBool::new(true),
            purge_attempted: AtomicBool::new(false),
            key_prefix: layout.key_prefix.clone(),
            curtain_prefix: layout.curtain_key_prefix.clone(),
        }
    }

    /// Store that never touches durable storage.
    pub fn memory_only(layout: &StorageConfig) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            durable: None,
            durable_enabled: AtomicBool::new(false),
            purge_attempted: AtomicBool::new(false),
            key_prefix: layout.key_prefix.clone(),
            curtain_prefix: layout.curtain_key_prefix.clone(),
        }
    }

    /// Whether writes still reach durable storage.
    pub fn is_durable(&self) -> bool {
        self.durable.is_some() && self.durable_enabled.load(Ordering::Acquire)
    }

    // ==================== Device state ====================

    /// Last stored state, or `None` if the device was never written.
    pub fn get(&self, id: &DeviceId) -> Option<String> {
        let key = self.device_key(id);
        self.read(&key)
    }

    /// Stored state or the class fallback (`"off"`/`"closed"`).
    pub fn state_or_default(&self, id: &DeviceId, class: DeviceClass) -> String {
        self.get(id)
            .unwrap_or_else(|| class.default_state().to_string())
    }

    /// Record a device's state. Always succeeds for readers in this session.
    pub fn set(&self, id: &DeviceId, value: &str) {
        let key = self.device_key(id);
        self.write(&key, value);
    }

    // ==================== Curtain state ====================

    /// Last curtain position, `"closed"` if unknown.
    pub fn get_curtain(&self, id: &DeviceId) -> String {
        let key = self.curtain_key(id);
        self.read(&key)
            .unwrap_or_else(|| state::CLOSED.to_string())
    }

    pub fn set_curtain(&self, id: &DeviceId, value: &str) {
        let key = self.curtain_key(id);
        self.write(&key, value);
    }

    // ==================== Internals ====================

    fn device_key(&self, id: &DeviceId) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    fn curtain_key(&self, id: &DeviceId) -> String {
        format!("{}{}", self.curtain_prefix, id)
    }

    fn read(&self, key: &str) -> Option<String> {
        if let Ok(memory) = self.memory.lock() {
            if let Some(v) = memory.get(key) {
                return Some(v.clone());
            }
        }

        let durable = self.durable.as_ref()?;
        match durable.get(key) {
            Ok(Some(value)) => {
                if let Ok(mut memory) = self.memory.lock() {
                    memory.entry(key.to_string()).or_insert_with(|| value.clone());
                }
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Durable state read failed");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key.to_string(), value.to_string());
        }

        if !self.is_durable() {
            return;
        }
        let Some(durable) = self.durable.as_ref() else {
            return;
        };

        match durable.put(key, value) {
            Ok(()) => {}
            Err(Error::QuotaExceeded(reason)) => {
                self.recover_from_quota(&**durable, key, value, &reason)
            }
            Err(e) => self.disable_durable(&format!("write failed: {}", e)),
        }
    }

    fn recover_from_quota(&self, durable: &dyn DurableStorage, key: &str, value: &str, reason: &str) {
        if self.purge_attempted.swap(true, Ordering::AcqRel) {
            self.disable_durable(&format!("quota exceeded again: {}", reason));
            return;
        }

        let removed = self.purge_except(durable, key);
        if removed == 0 {
            self.disable_durable(&format!("quota exceeded and nothing to purge: {}", reason));
            return;
        }

        match durable.put(key, value) {
            Ok(()) => {
                tracing::info!(removed, "Recovered durable state storage after purge");
            }
            Err(e) => self.disable_durable(&format!("write failed after purge: {}", e)),
        }
    }

    /// Remove every engine-owned key except `keep`. The memory mirror is untouched.
    fn purge_except(&self, durable: &dyn DurableStorage, keep: &str) -> usize {
        let mut removed = 0;
        for prefix in [&self.key_prefix, &self.curtain_prefix] {
            let keys = match durable.keys_with_prefix(prefix) {
                Ok(keys) => keys,
                Err(e) => {
                    tracing::debug!(prefix = %prefix, error = %e, "Could not list keys for purge");
                    continue;
                }
            };
            for k in keys.iter().filter(|k| k.as_str() != keep) {
                if durable.remove(k).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn disable_durable(&self, reason: &str) {
        if self.durable_enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                reason,
                "Durable state storage disabled; continuing with session-only state"
            );
        }
    }
}
