//! Executes matched voice commands against the collaborators.
//! Collaborator failures never escape: every path maps to a typed outcome
//! with a speakable message.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alerts::{AlertApi, AlertKind, AlertRequest};
use crate::commands::registry::{CommandAction, CommandRegistry};
use crate::dispatch::{DispatchOutcome, EscalationDispatcher};
use crate::history::{AlertRecord, HistoryStore, RecordOutcome};
use crate::location::LocationProvider;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::session::ListeningState;
use crate::settings::{SettingsStore, VigilSettings};
use crate::trigger::HitAccumulator;

/// Result of one processed utterance on the command path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandOutcome {
    EmergencySent {
        alert_id: String,
        message: String,
    },
    EmergencyFailed {
        message: String,
    },
    CheckInSent {
        alert_id: String,
        message: String,
    },
    CheckInFailed {
        message: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        address: Option<String>,
        message: String,
    },
    LocationFailed {
        message: String,
    },
    LocationShared {
        alert_id: String,
        message: String,
    },
    LocationShareFailed {
        message: String,
    },
    Status {
        listening: bool,
        hits: usize,
        required: u32,
        message: String,
    },
    /// Instruction for the session; the engine itself mutates nothing.
    StopListening {
        message: String,
    },
    /// Instruction for the session.
    StartListening {
        message: String,
    },
    TestOk {
        message: String,
    },
    UnknownAction {
        action: String,
        input: String,
        message: String,
    },
    NoMatch {
        input: String,
    },
}

impl CommandOutcome {
    /// Text for voice feedback; `None` stays silent.
    pub fn spoken_message(&self) -> Option<&str> {
        match self {
            CommandOutcome::EmergencySent { message, .. }
            | CommandOutcome::EmergencyFailed { message }
            | CommandOutcome::CheckInSent { message, .. }
            | CommandOutcome::CheckInFailed { message }
            | CommandOutcome::Location { message, .. }
            | CommandOutcome::LocationFailed { message }
            | CommandOutcome::LocationShared { message, .. }
            | CommandOutcome::LocationShareFailed { message }
            | CommandOutcome::Status { message, .. }
            | CommandOutcome::StopListening { message }
            | CommandOutcome::StartListening { message }
            | CommandOutcome::TestOk { message }
            | CommandOutcome::UnknownAction { message, .. } => Some(message),
            CommandOutcome::NoMatch { .. } => None,
        }
    }
}

pub struct CommandEngine {
    registry: RwLock<CommandRegistry>,
    settings: Arc<SettingsStore>,
    dispatcher: Arc<EscalationDispatcher>,
    accumulator: Arc<HitAccumulator>,
    alerts: Arc<dyn AlertApi>,
    location: Arc<dyn LocationProvider>,
    history: Arc<HistoryStore>,
    metrics: Arc<MetricsRegistry>,
    listening: Arc<ListeningState>,
}

impl CommandEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<SettingsStore>,
        dispatcher: Arc<EscalationDispatcher>,
        accumulator: Arc<HitAccumulator>,
        alerts: Arc<dyn AlertApi>,
        location: Arc<dyn LocationProvider>,
        history: Arc<HistoryStore>,
        metrics: Arc<MetricsRegistry>,
        listening: Arc<ListeningState>,
    ) -> Self {
        let mut registry = CommandRegistry::new();
        registry.rebuild_custom(&settings.snapshot());
        Self {
            registry: RwLock::new(registry),
            settings,
            dispatcher,
            accumulator,
            alerts,
            location,
            history,
            metrics,
            listening,
        }
    }

    /// Re-sync the registry's settings-sourced commands and aliases.
    pub fn rebuild_custom(&self, settings: &VigilSettings) {
        let mut registry = self.registry.write();
        registry.rebuild_custom(settings);
        info!(commands = registry.len(), "command_registry_rebuilt");
    }

    pub fn command_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Match the utterance and run the bound action.
    pub async fn process_voice_input(&self, raw: &str) -> CommandOutcome {
        if raw.trim().is_empty() {
            return CommandOutcome::NoMatch {
                input: raw.to_string(),
            };
        }

        let span = self.metrics.span(metric_names::COMMAND_MATCH);
        let matched = self.registry.read().resolve(raw);
        span.finish();

        let Some(matched) = matched else {
            debug!(len = raw.len(), "command_no_match");
            return CommandOutcome::NoMatch {
                input: raw.to_string(),
            };
        };

        info!(
            phrase = %matched.entry.phrase,
            tier = ?matched.tier,
            confidence = matched.confidence,
            "command_matched"
        );

        match matched.entry.action.clone() {
            CommandAction::Emergency => self.run_emergency().await,
            CommandAction::CheckIn => self.run_check_in().await,
            CommandAction::GetLocation => self.run_get_location().await,
            CommandAction::ShareLocation => self.run_share_location().await,
            CommandAction::GetStatus => self.run_get_status(),
            CommandAction::StopListening => CommandOutcome::StopListening {
                message: "Voice monitoring paused".to_string(),
            },
            CommandAction::StartListening => CommandOutcome::StartListening {
                message: "Voice monitoring resumed".to_string(),
            },
            CommandAction::Test => CommandOutcome::TestOk {
                message: "Voice commands are working".to_string(),
            },
            CommandAction::Other(action) => CommandOutcome::UnknownAction {
                action,
                input: raw.to_string(),
                message: "That command is not configured".to_string(),
            },
        }
    }

    /// Same single-flight gate as threshold escalation; a busy dispatcher
    /// surfaces as a failed outcome instead of a silent drop.
    async fn run_emergency(&self) -> CommandOutcome {
        match self.dispatcher.handle_emergency().await {
            Some(DispatchOutcome::EmergencySent { alert_id, message }) => {
                CommandOutcome::EmergencySent { alert_id, message }
            }
            Some(DispatchOutcome::EmergencyFailed { message }) => {
                CommandOutcome::EmergencyFailed { message }
            }
            Some(other) => {
                warn!(outcome = ?other, "unexpected dispatch outcome for emergency command");
                CommandOutcome::EmergencyFailed {
                    message: "Emergency dispatch did not complete".to_string(),
                }
            }
            None => CommandOutcome::EmergencyFailed {
                message: "Emergency dispatch already in progress".to_string(),
            },
        }
    }

    /// Check-ins go out even without a position.
    async fn run_check_in(&self) -> CommandOutcome {
        let fix = match self.location.current_fix().await {
            Ok(fix) => fix,
            Err(e) => {
                debug!(error = %e, "check_in_location_unavailable");
                None
            }
        };

        let request = AlertRequest {
            kind: AlertKind::CheckIn,
            message: "Automatic check-in".to_string(),
            location: fix,
        };
        match self.alerts.create_alert(&request).await {
            Ok(receipt) => {
                self.history.record(AlertRecord::new(
                    AlertKind::CheckIn,
                    RecordOutcome::Sent,
                    Some(receipt.alert_id.clone()),
                    "Check-in sent",
                ));
                info!(alert_id = %receipt.alert_id, "check_in_sent");
                CommandOutcome::CheckInSent {
                    alert_id: receipt.alert_id,
                    message: "Check-in sent to your contacts".to_string(),
                }
            }
            Err(e) => {
                warn!(error = %e, "check_in_failed");
                self.history.record(AlertRecord::new(
                    AlertKind::CheckIn,
                    RecordOutcome::Failed,
                    None,
                    &format!("check-in failed: {e}"),
                ));
                CommandOutcome::CheckInFailed {
                    message: "Check-in could not be sent".to_string(),
                }
            }
        }
    }

    async fn run_get_location(&self) -> CommandOutcome {
        let span = self.metrics.span(metric_names::LOCATION_FIX);
        let fix = self.location.current_fix().await;
        span.finish();

        match fix {
            Ok(Some(fix)) => CommandOutcome::Location {
                latitude: fix.latitude,
                longitude: fix.longitude,
                address: fix.address.clone(),
                message: format!("You are at {}", fix.describe()),
            },
            Ok(None) => CommandOutcome::LocationFailed {
                message: "Your location is not available right now".to_string(),
            },
            Err(e) => {
                warn!(error = %e, "get_location_failed");
                CommandOutcome::LocationFailed {
                    message: "Your location is not available right now".to_string(),
                }
            }
        }
    }

    async fn run_share_location(&self) -> CommandOutcome {
        if !self.settings.snapshot().privacy.share_location {
            return CommandOutcome::LocationShareFailed {
                message: "Location sharing is disabled in settings".to_string(),
            };
        }

        let fix = match self.location.current_fix().await {
            Ok(Some(fix)) => fix,
            Ok(None) => {
                return CommandOutcome::LocationShareFailed {
                    message: "Your location is not available right now".to_string(),
                };
            }
            Err(e) => {
                warn!(error = %e, "share_location_failed");
                return CommandOutcome::LocationShareFailed {
                    message: "Your location is not available right now".to_string(),
                };
            }
        };

        let request = AlertRequest {
            kind: AlertKind::LocationShare,
            message: format!("Current location: {}", fix.describe()),
            location: Some(fix),
        };
        match self.alerts.create_alert(&request).await {
            Ok(receipt) => {
                self.history.record(AlertRecord::new(
                    AlertKind::LocationShare,
                    RecordOutcome::Sent,
                    Some(receipt.alert_id.clone()),
                    "Location shared",
                ));
                info!(alert_id = %receipt.alert_id, "location_shared");
                CommandOutcome::LocationShared {
                    alert_id: receipt.alert_id,
                    message: "Location shared with your contacts".to_string(),
                }
            }
            Err(e) => {
                warn!(error = %e, "location_share_failed");
                self.history.record(AlertRecord::new(
                    AlertKind::LocationShare,
                    RecordOutcome::Failed,
                    None,
                    &format!("location share failed: {e}"),
                ));
                CommandOutcome::LocationShareFailed {
                    message: "Location could not be shared".to_string(),
                }
            }
        }
    }

    fn run_get_status(&self) -> CommandOutcome {
        let status = self.accumulator.hit_status();
        let listening = self.listening.is_listening();
        let commands = self.registry.read().len();
        let message = format!(
            "{}. {} of {} hits recorded. {} commands available.",
            if listening { "Listening" } else { "Not listening" },
            status.count,
            status.required,
            commands,
        );
        CommandOutcome::Status {
            listening,
            hits: status.count,
            required: status.required,
            message,
        }
    }
}
