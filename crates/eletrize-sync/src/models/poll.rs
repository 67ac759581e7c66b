//! Poll Payload Models
//!
//! The polling endpoint answers in one of two layouts:
//!
//! ```json
//! { "devices": { "231": { "state": "on", "success": true } } }
//! ```
//!
//! ```json
//! { "success": true, "data": [ { "id": "231", "attributes": [ { "name": "switch", "currentValue": "on" } ] } ] }
//! ```
//!
//! where `attributes` may also be a flat object. Both are decoded here, once,
//! into a [`Snapshot`]; nothing downstream knows which layout the hub used.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{state, DeviceId};
use crate::error::{Error, Result};

/// What a poll learned about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// Device answered; `attributes` carries secondary values such as `volume`.
    Reported {
        state: String,
        attributes: BTreeMap<String, String>,
    },
    /// Device was part of the batch but the hub could not read it.
    Failed { error: String },
}

impl Reading {
    pub fn reported(state: impl Into<String>) -> Self {
        Reading::Reported {
            state: state.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Reading::Failed {
            error: error.into(),
        }
    }

    pub fn state(&self) -> Option<&str> {
        match self {
            Reading::Reported { state, .. } => Some(state),
            Reading::Failed { .. } => None,
        }
    }
}

/// Canonical result of one poll: device id to reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    readings: BTreeMap<DeviceId, Reading>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for fakes.
    pub fn with(mut self, id: impl Into<DeviceId>, reading: Reading) -> Self {
        self.readings.insert(id.into(), reading);
        self
    }

    pub fn insert(&mut self, id: DeviceId, reading: Reading) {
        self.readings.insert(id, reading);
    }

    pub fn get(&self, id: &str) -> Option<&Reading> {
        self.readings.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &Reading)> {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Ids the hub could not read in this batch.
    pub fn failed_ids(&self) -> Vec<&DeviceId> {
        self.readings
            .iter()
            .filter(|(_, r)| matches!(r, Reading::Failed { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    /// Decode a raw response body.
    ///
    /// HTML pages and non-JSON bodies are [`Error::MalformedResponse`], as is
    /// JSON in neither known layout.
    pub fn decode(body: &str) -> Result<Self> {
        if looks_like_html(body) {
            return Err(Error::malformed("received an HTML document instead of JSON"));
        }
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::malformed(format!("body is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let payload: PollPayload = serde_json::from_value(value)
            .map_err(|_| Error::malformed("poll payload has neither `devices` nor `data`"))?;
        Ok(payload.into_snapshot())
    }
}

/// Whether a body is an HTML page, e.g. an SPA fallback served in place of the function.
pub fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    let prefix: String = head.chars().take(9).collect::<String>().to_ascii_lowercase();
    prefix.starts_with("<!doctype") || prefix.starts_with("<html")
}

// ==================== Wire layouts ====================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PollPayload {
    Keyed {
        devices: BTreeMap<String, Option<KeyedEntry>>,
    },
    Listed {
        data: Vec<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct KeyedEntry {
    #[serde(default)]
    state: Option<Value>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    volume: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListedDevice {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    attributes: Option<Attributes>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Attributes {
    List(Vec<AttributeEntry>),
    Map(Map<String, Value>),
}

#[derive(Debug, Deserialize)]
struct AttributeEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "currentValue")]
    current_value: Option<Value>,
    #[serde(default)]
    value: Option<Value>,
}

impl AttributeEntry {
    fn scalar(&self) -> Option<String> {
        self.current_value
            .as_ref()
            .and_then(scalar)
            .filter(|s| !s.is_empty())
            .or_else(|| self.value.as_ref().and_then(scalar))
    }
}

const SWITCH: &str = "switch";

impl PollPayload {
    fn into_snapshot(self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        match self {
            PollPayload::Keyed { devices } => {
                for (id, entry) in devices {
                    let Some(entry) = entry else { continue };
                    snapshot.insert(DeviceId::from(id), entry.into_reading());
                }
            }
            PollPayload::Listed { data } => {
                for raw in data {
                    let Ok(device) = serde_json::from_value::<ListedDevice>(raw) else {
                        tracing::debug!("Skipping undecodable device entry in poll payload");
                        continue;
                    };
                    if let Some((id, reading)) = device.into_reading() {
                        snapshot.insert(id, reading);
                    }
                }
            }
        }
        snapshot
    }
}

impl KeyedEntry {
    fn into_reading(self) -> Reading {
        if !self.success {
            return Reading::failed(self.error.unwrap_or_else(|| "device read failed".into()));
        }
        let state = match self.state {
            Some(Value::Bool(on)) => Some(if on { state::ON } else { state::OFF }.to_string()),
            Some(v) => scalar(&v),
            None => None,
        };
        let Some(state) = state else {
            return Reading::failed("device reported no state");
        };
        let mut attributes = BTreeMap::new();
        if let Some(volume) = self.volume.as_ref().and_then(scalar) {
            attributes.insert("volume".to_string(), volume);
        }
        Reading::Reported { state, attributes }
    }
}

impl ListedDevice {
    fn into_reading(self) -> Option<(DeviceId, Reading)> {
        let id = self.id.as_ref().and_then(scalar).filter(|s| !s.is_empty())?;
        let mut attributes = BTreeMap::new();

        let state = match self.attributes {
            Some(Attributes::List(entries)) => {
                let mut switch = None;
                for entry in &entries {
                    let (Some(name), Some(value)) = (entry.name.as_deref(), entry.scalar()) else {
                        continue;
                    };
                    if name == SWITCH {
                        switch = Some(value);
                    } else {
                        attributes.insert(name.to_string(), value);
                    }
                }
                switch.map(power_or_raw).unwrap_or_else(|| state::OFF.to_string())
            }
            Some(Attributes::Map(map)) => {
                let switch = map.get(SWITCH).and_then(scalar)?;
                for (name, value) in &map {
                    if name != SWITCH {
                        if let Some(v) = scalar(value) {
                            attributes.insert(name.clone(), v);
                        }
                    }
                }
                power_or_raw(switch)
            }
            None => state::OFF.to_string(),
        };

        Some((DeviceId::from(id), Reading::Reported { state, attributes }))
    }
}

fn power_or_raw(raw: String) -> String {
    state::normalize_power(&raw)
        .map(str::to_string)
        .unwrap_or(raw)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
