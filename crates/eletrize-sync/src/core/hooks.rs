//! Optional host capabilities.
//!
//! A host that can show toasts or a volume slider implements these; one that
//! cannot simply leaves them unset.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::DeviceId;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Transient, dismissible message for the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, message)
    }
}

/// Receives connectivity and command-failure notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Receives secondary attributes (volume, level) reported by polls.
pub trait AttributeObserver: Send + Sync {
    fn on_attributes(&self, id: &DeviceId, attributes: &BTreeMap<String, String>);
}
