//! Emergency escalation with a single-flight gate.
//!
//! A threshold escalation and a voice-matched emergency command can land
//! almost simultaneously. Both funnel through one dispatcher; an atomic
//! phase claimed before the first await guarantees at most one dispatch in
//! flight, and the loser is dropped rather than queued.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::alerts::{AlertApi, AlertKind, AlertRequest};
use crate::history::{AlertRecord, HistoryStore, RecordOutcome};
use crate::location::LocationProvider;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::notify::NotificationSink;
use crate::trigger::HitStatus;

const PHASE_IDLE: u8 = 0;
const PHASE_DISPATCHING: u8 = 1;

const EMERGENCY_MESSAGE: &str = "Emergency alert triggered by voice";

/// Dispatch view for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct AlertDispatchState {
    pub is_processing: bool,
    pub current_alert_id: Option<String>,
}

/// Result of one escalation request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Sub-threshold hit: the embedding layer should show a confirmation
    /// prompt and call back with confirmed or cancelled.
    ConfirmationRequested { status: HitStatus },
    EmergencySent { alert_id: String, message: String },
    EmergencyFailed { message: String },
    Cancelled,
}

/// How the emergency was initiated. Controls who reports failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchTrigger {
    /// Threshold escalation or emergency voice command. Nobody is watching
    /// a prompt, so failures raise a local notification.
    Auto,
    /// User confirmed an on-screen prompt; the UI presents the failure
    /// itself.
    Confirmed,
}

impl DispatchTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            DispatchTrigger::Auto => "auto",
            DispatchTrigger::Confirmed => "confirmed",
        }
    }
}

/// Returns the phase to idle on every exit path.
struct PhaseReset<'a> {
    phase: &'a AtomicU8,
}

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
    }
}

pub struct EscalationDispatcher {
    alerts: Arc<dyn AlertApi>,
    location: Arc<dyn LocationProvider>,
    notifier: Arc<dyn NotificationSink>,
    history: Arc<HistoryStore>,
    metrics: Arc<MetricsRegistry>,
    phase: AtomicU8,
    current_alert_id: Mutex<Option<String>>,
}

impl EscalationDispatcher {
    pub fn new(
        alerts: Arc<dyn AlertApi>,
        location: Arc<dyn LocationProvider>,
        notifier: Arc<dyn NotificationSink>,
        history: Arc<HistoryStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            alerts,
            location,
            notifier,
            history,
            metrics,
            phase: AtomicU8::new(PHASE_IDLE),
            current_alert_id: Mutex::new(None),
        }
    }

    /// Sub-threshold hit. No phase, no network; the caller surfaces the
    /// confirmation prompt.
    pub fn handle_single_hit(&self, status: HitStatus) -> DispatchOutcome {
        DispatchOutcome::ConfirmationRequested { status }
    }

    /// Threshold escalation or emergency voice command. `None` means a
    /// dispatch was already in flight and this request was dropped.
    pub async fn handle_emergency(&self) -> Option<DispatchOutcome> {
        self.dispatch_alert(DispatchTrigger::Auto).await
    }

    /// User confirmed a pending prompt.
    pub async fn handle_emergency_confirmed(&self) -> Option<DispatchOutcome> {
        self.dispatch_alert(DispatchTrigger::Confirmed).await
    }

    /// User dismissed a pending confirmation. Unconditionally returns the
    /// phase to idle.
    pub fn handle_emergency_cancelled(&self) -> DispatchOutcome {
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
        self.history.record(AlertRecord::new(
            AlertKind::Emergency,
            RecordOutcome::Cancelled,
            None,
            "Emergency cancelled by user",
        ));
        info!("emergency_cancelled");
        DispatchOutcome::Cancelled
    }

    pub fn current_status(&self) -> AlertDispatchState {
        AlertDispatchState {
            is_processing: self.phase.load(Ordering::SeqCst) == PHASE_DISPATCHING,
            current_alert_id: self.current_alert_id.lock().clone(),
        }
    }

    pub fn reset(&self) {
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
        *self.current_alert_id.lock() = None;
    }

    async fn dispatch_alert(&self, trigger: DispatchTrigger) -> Option<DispatchOutcome> {
        // Claim the phase before the first await. The loser of the race
        // sees Dispatching and is dropped here.
        if self
            .phase
            .compare_exchange(
                PHASE_IDLE,
                PHASE_DISPATCHING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!(trigger = trigger.as_str(), "emergency_dispatch_dropped_busy");
            return None;
        }
        let _reset = PhaseReset { phase: &self.phase };

        let span = self.metrics.span(metric_names::DISPATCH_EMERGENCY);
        let outcome = self.submit_emergency(trigger).await;
        span.finish();
        Some(outcome)
    }

    async fn submit_emergency(&self, trigger: DispatchTrigger) -> DispatchOutcome {
        let fix_span = self.metrics.span(metric_names::LOCATION_FIX);
        let fix = self.location.current_fix().await;
        fix_span.finish();

        // No position means no alert. A contact alert without location is
        // not actionable, so fail fast and tell the user.
        let fix = match fix {
            Ok(Some(fix)) => fix,
            Ok(None) => return self.fail(trigger, "location unavailable".to_string()).await,
            Err(e) => {
                return self
                    .fail(trigger, format!("location unavailable: {e}"))
                    .await;
            }
        };

        info!(
            trigger = trigger.as_str(),
            location = %fix.describe(),
            "emergency_dispatch_started"
        );

        let request = AlertRequest {
            kind: AlertKind::Emergency,
            message: EMERGENCY_MESSAGE.to_string(),
            location: Some(fix),
        };

        let submit_span = self.metrics.span(metric_names::ALERT_SUBMIT);
        let receipt = self.alerts.create_alert(&request).await;
        submit_span.finish();

        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(e) => {
                return self
                    .fail(trigger, format!("alert submission failed: {e}"))
                    .await;
            }
        };

        *self.current_alert_id.lock() = Some(receipt.alert_id.clone());

        if let Err(e) = self.location.start_tracking(&receipt.alert_id).await {
            warn!(error = %e, alert_id = %receipt.alert_id, "location tracking failed to start");
        }

        let message = "Emergency alert sent".to_string();
        if let Err(e) = self
            .notifier
            .notify(
                "Emergency alert sent",
                "Your emergency contacts have been notified.",
                serde_json::json!({ "alert_id": receipt.alert_id }),
            )
            .await
        {
            warn!(error = %e, "emergency notification failed");
        }

        self.history.record(AlertRecord::new(
            AlertKind::Emergency,
            RecordOutcome::Sent,
            Some(receipt.alert_id.clone()),
            &message,
        ));
        info!(alert_id = %receipt.alert_id, "emergency_alert_sent");

        DispatchOutcome::EmergencySent {
            alert_id: receipt.alert_id,
            message,
        }
    }

    async fn fail(&self, trigger: DispatchTrigger, message: String) -> DispatchOutcome {
        error!(
            trigger = trigger.as_str(),
            message = %message,
            "emergency_dispatch_failed"
        );
        self.history.record(AlertRecord::new(
            AlertKind::Emergency,
            RecordOutcome::Failed,
            None,
            &message,
        ));

        if trigger == DispatchTrigger::Auto {
            if let Err(e) = self
                .notifier
                .notify("Emergency alert failed", &message, serde_json::Value::Null)
                .await
            {
                warn!(error = %e, "failure notification failed");
            }
        }

        DispatchOutcome::EmergencyFailed { message }
    }
}
