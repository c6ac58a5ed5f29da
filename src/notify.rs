//! Local notifications.
//! The dispatcher tells the user what happened through this seam; the
//! shipped adapter shells out to a notify-send style helper.

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum NotifyError {
    Unavailable(String),
    Failed(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Unavailable(tool) => write!(f, "notifier unavailable: {tool}"),
            NotifyError::Failed(msg) => write!(f, "notification failed: {msg}"),
        }
    }
}

/// Notification seam. `data` is an opaque payload for platforms that can
/// attach it to the notification.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// notify-send style adapter, probed at construction.
pub struct CommandNotifier {
    command: String,
    available: bool,
}

impl CommandNotifier {
    pub fn new(command: &str) -> Self {
        let available = probe_command(command);
        if available {
            info!(command, "notifier_available");
        } else {
            warn!(command, "notifier not found, local notifications disabled");
        }
        Self {
            command: command.to_string(),
            available,
        }
    }
}

#[async_trait]
impl NotificationSink for CommandNotifier {
    async fn notify(
        &self,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        if !self.available {
            return Err(NotifyError::Unavailable(self.command.clone()));
        }
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("--app-name=vigil");
        if !data.is_null() {
            cmd.arg(format!("--hint=string:x-vigil-data:{data}"));
        }
        cmd.arg(title).arg(body);

        let output = cmd
            .output()
            .await
            .map_err(|e| NotifyError::Failed(format!("{} exec failed: {e}", self.command)))?;
        if !output.status.success() {
            return Err(NotifyError::Failed(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }
        debug!(title, "notification_sent");
        Ok(())
    }
}

/// Probe whether a command is available on PATH.
fn probe_command(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
