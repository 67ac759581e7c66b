//! Device Models

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::state;
use crate::error::Error;

/// Hub-assigned device identifier.
///
/// Opaque: the engine never interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Vocabulary family of a device, which fixes its fallback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Lights, power relays, receivers: `on`/`off`
    Switch,
    /// Curtain controllers: `open`/`closed`
    Curtain,
}

impl DeviceClass {
    /// State assumed when nothing has been stored yet.
    pub fn default_state(self) -> &'static str {
        match self {
            DeviceClass::Switch => state::OFF,
            DeviceClass::Curtain => state::CLOSED,
        }
    }
}

/// Logical curtain action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurtainAction {
    Open,
    Stop,
    Close,
}

impl CurtainAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CurtainAction::Open => "open",
            CurtainAction::Stop => "stop",
            CurtainAction::Close => "close",
        }
    }
}

impl FromStr for CurtainAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(CurtainAction::Open),
            "stop" => Ok(CurtainAction::Stop),
            "close" => Ok(CurtainAction::Close),
            other => Err(Error::InvalidInput(format!("Invalid curtain action: {}", other))),
        }
    }
}

/// Push ordinals a curtain controller expects for each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurtainMapping {
    pub open: u8,
    pub stop: u8,
    pub close: u8,
}

impl Default for CurtainMapping {
    fn default() -> Self {
        Self {
            open: 1,
            stop: 2,
            close: 3,
        }
    }
}

impl CurtainMapping {
    /// Open and close swapped.
    pub fn inverted() -> Self {
        Self {
            open: 3,
            stop: 2,
            close: 1,
        }
    }

    pub fn ordinal(&self, action: CurtainAction) -> u8 {
        match action {
            CurtainAction::Open => self.open,
            CurtainAction::Stop => self.stop,
            CurtainAction::Close => self.close,
        }
    }
}

/// What a curtain control asked for: a logical action or a raw button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurtainCommand {
    Action(CurtainAction),
    /// `pushN` sent verbatim
    Push(u8),
}

impl FromStr for CurtainCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix("push") {
            return n
                .parse::<u8>()
                .map(CurtainCommand::Push)
                .map_err(|_| Error::InvalidInput(format!("Invalid push command: {}", s)));
        }
        s.parse().map(CurtainCommand::Action)
    }
}

/// A single command addressed to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device: DeviceId,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl CommandRequest {
    pub fn new(device: DeviceId, command: impl Into<String>) -> Self {
        Self {
            device,
            command: command.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}:{}({})", self.device, self.command, v),
            None => write!(f, "{}:{}", self.device, self.command),
        }
    }
}

/// Vocabulary a master control aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterKind {
    Lights,
    Curtains,
}
