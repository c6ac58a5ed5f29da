//! Location acquisition.
//! Trait seam plus a helper-command provider (termux-location style: JSON
//! document on stdout), probed for availability once at construction.
//! Background tracking is a polling task under a cancellation token; the
//! embedding layer decides what to do with streamed fixes.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A resolved position with optional reverse-geocoded address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub accuracy: f32,
    pub address: Option<String>,
}

impl LocationFix {
    /// Human-readable form for spoken/notified messages.
    pub fn describe(&self) -> String {
        match &self.address {
            Some(address) => address.clone(),
            None => format!("{:.5}, {:.5}", self.latitude, self.longitude),
        }
    }
}

#[derive(Debug)]
pub enum LocationError {
    ProviderUnavailable(String),
    AcquisitionFailed(String),
    Parse(String),
}

impl std::fmt::Display for LocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationError::ProviderUnavailable(tool) => {
                write!(f, "location provider unavailable: {tool}")
            }
            LocationError::AcquisitionFailed(msg) => write!(f, "location acquisition failed: {msg}"),
            LocationError::Parse(msg) => write!(f, "location parse error: {msg}"),
        }
    }
}

/// Location seam. `current_fix` distinguishes "provider answered with no
/// position" (`Ok(None)`) from provider failure (`Err`).
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_fix(&self) -> Result<Option<LocationFix>, LocationError>;
    /// Begin periodic acquisition tagged with the alert id. Starting again
    /// replaces any previous tracking task.
    async fn start_tracking(&self, alert_id: &str) -> Result<(), LocationError>;
    async fn stop_tracking(&self);
}

/// Helper-command provider: runs e.g. `termux-location -p gps` and parses
/// the JSON it prints. Requires the helper on PATH.
pub struct CommandLocationProvider {
    command: String,
    args: Vec<String>,
    poll_interval: Duration,
    available: bool,
    tracker: Mutex<Option<CancellationToken>>,
}

impl CommandLocationProvider {
    /// Probes for the helper at construction time.
    pub fn new(command: &str, args: &[&str]) -> Self {
        let available = probe_command(command);
        if available {
            info!(command, "location_helper_available");
        } else {
            warn!(command, "location helper not found, location will be unavailable");
        }
        Self {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            poll_interval: Duration::from_secs(30),
            available,
            tracker: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl LocationProvider for CommandLocationProvider {
    async fn current_fix(&self) -> Result<Option<LocationFix>, LocationError> {
        if !self.available {
            return Err(LocationError::ProviderUnavailable(self.command.clone()));
        }
        acquire(&self.command, &self.args).await
    }

    async fn start_tracking(&self, alert_id: &str) -> Result<(), LocationError> {
        if !self.available {
            return Err(LocationError::ProviderUnavailable(self.command.clone()));
        }
        let token = CancellationToken::new();
        {
            let mut slot = self.tracker.lock();
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(token.clone());
        }

        let command = self.command.clone();
        let args = self.args.clone();
        let interval = self.poll_interval;
        let alert_id = alert_id.to_string();
        tokio::spawn(async move {
            info!(alert_id = %alert_id, "location_tracking_started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match acquire(&command, &args).await {
                            Ok(Some(fix)) => debug!(
                                alert_id = %alert_id,
                                latitude = fix.latitude,
                                longitude = fix.longitude,
                                "tracking_fix"
                            ),
                            Ok(None) => debug!(alert_id = %alert_id, "tracking_no_fix"),
                            Err(e) => warn!(alert_id = %alert_id, error = %e, "tracking_acquire_failed"),
                        }
                    }
                }
            }
            info!(alert_id = %alert_id, "location_tracking_stopped");
        });
        Ok(())
    }

    async fn stop_tracking(&self) {
        if let Some(token) = self.tracker.lock().take() {
            token.cancel();
        }
    }
}

/// Run the helper once and parse its stdout. Empty output means the helper
/// ran but has no position yet.
async fn acquire(command: &str, args: &[String]) -> Result<Option<LocationFix>, LocationError> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| LocationError::AcquisitionFailed(format!("{command} exec failed: {e}")))?;

    if !output.status.success() {
        return Err(LocationError::AcquisitionFailed(format!(
            "{command} exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let raw: HelperFix =
        serde_json::from_str(trimmed).map_err(|e| LocationError::Parse(e.to_string()))?;
    Ok(Some(LocationFix {
        latitude: raw.latitude,
        longitude: raw.longitude,
        accuracy: raw.accuracy.unwrap_or(0.0),
        address: raw.address,
    }))
}

/// Helper output shape; accuracy and address are optional in practice.
#[derive(Deserialize)]
struct HelperFix {
    latitude: f64,
    longitude: f64,
    accuracy: Option<f32>,
    address: Option<String>,
}

/// Probe whether a command is available on PATH.
fn probe_command(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
