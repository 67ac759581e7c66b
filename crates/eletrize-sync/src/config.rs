//! Sync Engine Configuration
//!
//! Configuration options for the reconciliation engine, loadable from a
//! JSON file or set programmatically via [`DashboardBuilder`](crate::DashboardBuilder).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{CurtainMapping, DeviceId};

/// Sync Engine Configuration
///
/// # Configuration file
///
/// ```json
/// {
///   "proxyUrl": "https://casa.example/hubitat-proxy",
///   "pollingUrl": "https://casa.example/polling",
///   "trackedDevices": ["231", "232", "15"],
///   "curtainOverrides": { "39": { "open": 3, "stop": 2, "close": 1 } },
///   "cadence": { "baseIntervalMs": 5000, "maxIntervalMs": 20000 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Local proxy endpoint that forwards commands to the hub.
    ///
    /// Default: `"http://localhost:8788/hubitat-proxy"`
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,

    /// Polling endpoint returning batched device state.
    ///
    /// Default: `"http://localhost:8788/polling"`
    #[serde(default = "default_polling_url")]
    pub polling_url: String,

    /// Cloud gateway used instead of the proxy for an allow-set of devices.
    #[serde(default)]
    pub cloud: Option<CloudGateway>,

    /// Devices whose state is fetched by each poll cycle.
    #[serde(default = "default_tracked_devices")]
    pub tracked_devices: Vec<DeviceId>,

    /// Devices that accept the `initialize` command at startup.
    #[serde(default)]
    pub devices_with_initialize: Vec<DeviceId>,

    /// Curtain controllers whose push buttons are wired in a non-standard order.
    ///
    /// Devices not listed here use [`CurtainMapping::default`]. Entries from a
    /// config file are layered over the built-in table (controller `39` is
    /// inverted); list a device with `1/2/3` to restore the standard order.
    #[serde(
        default = "default_curtain_overrides",
        deserialize_with = "merge_curtain_overrides"
    )]
    pub curtain_overrides: HashMap<DeviceId, CurtainMapping>,

    /// Adaptive polling cadence.
    #[serde(default)]
    pub cadence: CadenceConfig,

    /// Time after a local command during which polls cannot overwrite the device.
    ///
    /// Default: `8000`
    #[serde(default = "default_protection_window")]
    pub protection_window_ms: u64,

    /// Request timeout and retry policy for hub calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Coalescing delays for structural re-sync passes.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Durable state layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Batch shape for the startup `initialize` sweep.
    #[serde(default)]
    pub initialize: InitializeConfig,

    /// Fire a best-effort beacon when a command's primary request fails.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub beacon_fallback: bool,

    /// Delay before a master control's pending flag is cleared after its
    /// group command settles.
    ///
    /// Default: `1000`
    #[serde(default = "default_master_settle")]
    pub master_settle_ms: u64,

    /// Enable verbose per-cycle logging.
    ///
    /// Default: `false`
    #[serde(default)]
    pub debug: bool,
}

/// Cloud gateway addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudGateway {
    /// Base URL up to and including `/devices`.
    pub devices_base_url: String,

    /// Token appended as `access_token`.
    pub access_token: String,

    /// Devices routed through the gateway.
    #[serde(default)]
    pub device_ids: BTreeSet<DeviceId>,
}

impl CloudGateway {
    /// Whether commands for `id` go through this gateway.
    pub fn routes(&self, id: &DeviceId) -> bool {
        self.device_ids.contains(id)
    }
}

// ========================================================================
// Poll cadence
// ========================================================================

/// Polling cadence bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CadenceConfig {
    /// Fastest interval, used after a change is observed.
    #[serde(default = "default_base_interval")]
    pub base_interval_ms: u64,

    /// Added after every quiescent cycle.
    #[serde(default = "default_step")]
    pub step_ms: u64,

    /// Ceiling for both quiescent and error growth.
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Multiplier applied after a failed cycle.
    #[serde(default = "default_error_multiplier")]
    pub error_multiplier: f64,

    /// Lower bound on any scheduled delay.
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval(),
            step_ms: default_step(),
            max_interval_ms: default_max_interval(),
            error_multiplier: default_error_multiplier(),
            min_delay_ms: default_min_delay(),
        }
    }
}

// ========================================================================
// Network retry
// ========================================================================

/// Hub request timeouts and retry backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles afterwards.
    #[serde(default = "default_retry_base")]
    pub base_delay_ms: u64,

    /// Cap on the delay between attempts.
    #[serde(default = "default_retry_max")]
    pub max_delay_ms: u64,

    /// Bound on a single request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Bound on the startup health probe.
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_base(),
            max_delay_ms: default_retry_max(),
            request_timeout_ms: default_request_timeout(),
            health_check_timeout_ms: default_health_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

// ========================================================================
// Sync scheduler
// ========================================================================

/// Delays used to coalesce structural changes into one sync pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Upper bound when the host offers an idle callback.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// One frame when the host offers animation frames.
    #[serde(default = "default_frame_delay")]
    pub frame_delay_ms: u64,

    /// Plain timer fallback.
    #[serde(default = "default_timer_delay")]
    pub timer_delay_ms: u64,

    /// Periodic full re-sync when no mutation feed exists.
    #[serde(default = "default_fallback_resync")]
    pub fallback_resync_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
            frame_delay_ms: default_frame_delay(),
            timer_delay_ms: default_timer_delay(),
            fallback_resync_ms: default_fallback_resync(),
        }
    }
}

// ========================================================================
// Storage
// ========================================================================

/// Durable key layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Prefix of per-device state keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Prefix of curtain open/closed keys.
    #[serde(default = "default_curtain_prefix")]
    pub curtain_key_prefix: String,

    /// SQLite file name inside the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            curtain_key_prefix: default_curtain_prefix(),
            database_file: default_database_file(),
        }
    }
}

/// Startup `initialize` batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
}

impl Default for InitializeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay(),
        }
    }
}

fn default_proxy_url() -> String {
    "http://localhost:8788/hubitat-proxy".to_string()
}

fn default_polling_url() -> String {
    "http://localhost:8788/polling".to_string()
}

fn default_tracked_devices() -> Vec<DeviceId> {
    Vec::new()
}

fn default_curtain_overrides() -> HashMap<DeviceId, CurtainMapping> {
    // Controller 39 has its open and close buttons swapped.
    HashMap::from([(DeviceId::from("39"), CurtainMapping::inverted())])
}

fn merge_curtain_overrides<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<DeviceId, CurtainMapping>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let mut merged = default_curtain_overrides();
    merged.extend(HashMap::<DeviceId, CurtainMapping>::deserialize(deserializer)?);
    Ok(merged)
}

fn default_protection_window() -> u64 {
    8_000
}

fn default_true() -> bool {
    true
}

fn default_master_settle() -> u64 {
    1_000
}

fn default_base_interval() -> u64 {
    5_000
}

fn default_step() -> u64 {
    2_000
}

fn default_max_interval() -> u64 {
    20_000
}

fn default_error_multiplier() -> f64 {
    1.5
}

fn default_min_delay() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    1_000
}

fn default_retry_max() -> u64 {
    5_000
}

fn default_request_timeout() -> u64 {
    15_000
}

fn default_health_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_frame_delay() -> u64 {
    16
}

fn default_timer_delay() -> u64 {
    32
}

fn default_fallback_resync() -> u64 {
    8_000
}

fn default_key_prefix() -> String {
    "deviceState:".to_string()
}

fn default_curtain_prefix() -> String {
    "curtainState:".to_string()
}

fn default_database_file() -> String {
    "eletrize.db".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            polling_url: default_polling_url(),
            cloud: None,
            tracked_devices: default_tracked_devices(),
            devices_with_initialize: Vec::new(),
            curtain_overrides: default_curtain_overrides(),
            cadence: CadenceConfig::default(),
            protection_window_ms: default_protection_window(),
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
            initialize: InitializeConfig::default(),
            beacon_fallback: true,
            master_settle_ms: default_master_settle(),
            debug: false,
        }
    }
}

impl SyncConfig {
    /// Create a configuration for development/testing.
    ///
    /// Talks to a local proxy, disables the beacon fallback and enables
    /// debug logging.
    pub fn development() -> Self {
        Self {
            beacon_fallback: false,
            debug: true,
            ..Default::default()
        }
    }

    /// Create a configuration for a deployed dashboard behind `origin`.
    pub fn production(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/');
        Self {
            proxy_url: format!("{}/hubitat-proxy", origin),
            polling_url: format!("{}/polling", origin),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Check that endpoints parse and cadence bounds are coherent.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.proxy_url)?;
        url::Url::parse(&self.polling_url)?;
        if let Some(cloud) = &self.cloud {
            url::Url::parse(&cloud.devices_base_url)?;
        }

        let c = &self.cadence;
        if c.base_interval_ms == 0 {
            return Err(Error::Config("cadence.baseIntervalMs must be positive".into()));
        }
        if c.max_interval_ms < c.base_interval_ms {
            return Err(Error::Config(
                "cadence.maxIntervalMs must not be below baseIntervalMs".into(),
            ));
        }
        if !(c.error_multiplier >= 1.0) {
            return Err(Error::Config("cadence.errorMultiplier must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.maxAttempts must be at least 1".into()));
        }
        if self.initialize.batch_size == 0 {
            return Err(Error::Config("initialize.batchSize must be at least 1".into()));
        }
        if self.storage.key_prefix.is_empty()
            || self.storage.key_prefix == self.storage.curtain_key_prefix
        {
            return Err(Error::Config(
                "storage prefixes must be non-empty and distinct".into(),
            ));
        }
        Ok(())
    }

    pub fn protection_window(&self) -> Duration {
        Duration::from_millis(self.protection_window_ms)
    }

    pub fn master_settle(&self) -> Duration {
        Duration::from_millis(self.master_settle_ms)
    }

    /// Push mapping for a curtain controller.
    pub fn curtain_mapping(&self, id: &DeviceId) -> CurtainMapping {
        self.curtain_overrides.get(id).copied().unwrap_or_default()
    }

    /// Whether commands for `id` use the cloud gateway.
    pub fn is_cloud_device(&self, id: &DeviceId) -> bool {
        self.cloud.as_ref().is_some_and(|c| c.routes(id))
    }
}
