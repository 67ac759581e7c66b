//! Transport seams.
//!
//! The dispatcher and reconciler talk to the hub only through these traits,
//! so the HTTP client, the beacon fallback and test fakes are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{CommandRequest, DeviceId, Snapshot};

/// Delivers a single device command.
///
/// `Ok(Some(_))` is the hub's JSON reply, `Ok(None)` means the command was
/// accepted but the reply could not be read, `Err` means it was not delivered.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, request: &CommandRequest) -> Result<Option<Value>>;
}

/// Best-effort, response-less delivery path.
#[async_trait]
pub trait BeaconSink: Send + Sync {
    /// `Ok` once the request has left; nothing about its reception is known.
    async fn beacon(&self, request: &CommandRequest) -> Result<()>;
}

/// Batched device state source.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch(&self, ids: &[DeviceId]) -> Result<Snapshot>;

    /// Cheap reachability probe run before the first load.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: CommandTransport + ?Sized> CommandTransport for Arc<T> {
    async fn send(&self, request: &CommandRequest) -> Result<Option<Value>> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: PollSource + ?Sized> PollSource for Arc<T> {
    async fn fetch(&self, ids: &[DeviceId]) -> Result<Snapshot> {
        (**self).fetch(ids).await
    }

    async fn health_check(&self) -> Result<()> {
        (**self).health_check().await
    }
}

/// Falls back to a single beacon when the primary transport cannot reach the hub.
///
/// A successful beacon turns the failure into "accepted, unreadable". A
/// failed beacon surfaces the primary error. HTTP errors from a reachable
/// proxy are returned unchanged since the command did arrive.
pub struct WithBeaconFallback<T> {
    primary: T,
    beacon: Arc<dyn BeaconSink>,
}

impl<T: CommandTransport> WithBeaconFallback<T> {
    pub fn new(primary: T, beacon: Arc<dyn BeaconSink>) -> Self {
        Self { primary, beacon }
    }
}

#[async_trait]
impl<T: CommandTransport> CommandTransport for WithBeaconFallback<T> {
    async fn send(&self, request: &CommandRequest) -> Result<Option<Value>> {
        let err = match self.primary.send(request).await {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        if !matches!(err, Error::Network(_) | Error::Timeout(_)) {
            return Err(err);
        }

        tracing::warn!(request = %request, error = %err, "Primary delivery failed, sending beacon");
        match self.beacon.beacon(request).await {
            Ok(()) => Ok(None),
            Err(beacon_err) => {
                tracing::debug!(request = %request, error = %beacon_err, "Beacon delivery failed");
                Err(err)
            }
        }
    }
}
