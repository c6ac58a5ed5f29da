//! Voice session: the worker loop between the speech recognizer and the
//! escalation machinery, plus the single UI-facing event stream.
//!
//! Recognizer callbacks push into an unbounded channel via `RecognizerFeed`
//! and return immediately. One worker task drains the channel; per
//! utterance it runs the hit accumulator and the command engine. The two
//! paths run joined, hit path first, so an utterance that is both a wake
//! hit and an emergency command funnels both requests into the
//! dispatcher's single-flight gate instead of sending two alerts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{CommandEngine, CommandOutcome};
use crate::dispatch::{DispatchOutcome, EscalationDispatcher};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::settings::{SettingsStore, SettingsSubscription, VigilSettings};
use crate::speech::{SpeakOptions, SpeechSynth};
use crate::trigger::{HitAccumulator, HitOutcome, HitStatus};

/// Shared listening flag. The worker drops utterances while off; the
/// engine reads it for status reports.
pub struct ListeningState(AtomicBool);

impl ListeningState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(false)))
    }

    pub fn is_listening(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns true when the flag actually changed.
    pub(crate) fn set(&self, on: bool) -> bool {
        self.0.swap(on, Ordering::SeqCst) != on
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognizerStatus {
    Starting,
    Listening,
    Stopped,
    /// Recognition still running but impaired (e.g. repeated backend
    /// errors).
    Degraded,
}

enum RecognizerSignal {
    TextDetected(String),
    Error(String),
    StatusChanged(RecognizerStatus),
}

/// Clonable handle for recognizer callbacks. All sends are non-blocking
/// and safe from foreign threads.
#[derive(Clone)]
pub struct RecognizerFeed {
    tx: mpsc::UnboundedSender<RecognizerSignal>,
}

impl RecognizerFeed {
    pub fn text_detected(&self, text: &str) {
        self.send(RecognizerSignal::TextDetected(text.to_string()));
    }

    pub fn error(&self, message: &str) {
        self.send(RecognizerSignal::Error(message.to_string()));
    }

    pub fn status_changed(&self, status: RecognizerStatus) {
        self.send(RecognizerSignal::StatusChanged(status));
    }

    fn send(&self, signal: RecognizerSignal) {
        if self.tx.send(signal).is_err() {
            warn!("recognizer feed dropped, session worker gone");
        }
    }
}

/// Everything the embedding layer needs to render, on one stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum CoreEvent {
    Hit(HitStatus),
    Dispatch(DispatchOutcome),
    Command(CommandOutcome),
    ListeningChanged(bool),
    RecognizerError(String),
    Recognizer(RecognizerStatus),
    SettingsChanged { key: String },
}

pub struct VoiceSession {
    settings: Arc<SettingsStore>,
    accumulator: Arc<HitAccumulator>,
    engine: Arc<CommandEngine>,
    dispatcher: Arc<EscalationDispatcher>,
    speech: Arc<dyn SpeechSynth>,
    metrics: Arc<MetricsRegistry>,
    listening: Arc<ListeningState>,
    feed_tx: mpsc::UnboundedSender<RecognizerSignal>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CoreEvent>>>,
    shutdown: CancellationToken,
    _settings_sub: SettingsSubscription,
}

impl VoiceSession {
    /// Build the session and start its worker task. The settings listener
    /// registered here keeps the command registry in sync and forwards
    /// every settings change onto the event stream.
    pub fn new(
        settings: Arc<SettingsStore>,
        accumulator: Arc<HitAccumulator>,
        engine: Arc<CommandEngine>,
        dispatcher: Arc<EscalationDispatcher>,
        speech: Arc<dyn SpeechSynth>,
        metrics: Arc<MetricsRegistry>,
        listening: Arc<ListeningState>,
    ) -> Arc<Self> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let subscription = settings.add_listener({
            let events_tx = events_tx.clone();
            let engine = Arc::clone(&engine);
            move |key, _value, settings| {
                if matches!(key, "custom_commands" | "aliases") {
                    engine.rebuild_custom(settings);
                }
                let _ = events_tx.send(CoreEvent::SettingsChanged {
                    key: key.to_string(),
                });
            }
        });

        let session = Arc::new(Self {
            settings,
            accumulator,
            engine,
            dispatcher,
            speech,
            metrics,
            listening,
            feed_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            _settings_sub: subscription,
        });

        let worker = Arc::clone(&session);
        tokio::spawn(async move {
            worker.run(feed_rx).await;
        });
        session
    }

    /// Handle for recognizer callbacks.
    pub fn feed(&self) -> RecognizerFeed {
        RecognizerFeed {
            tx: self.feed_tx.clone(),
        }
    }

    /// The event stream. Yields `Some` exactly once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CoreEvent>> {
        self.events_rx.lock().take()
    }

    /// Returns false when already listening.
    pub fn start_listening(&self) -> bool {
        self.apply_listening(true)
    }

    /// Returns false when already stopped.
    pub fn stop_listening(&self) -> bool {
        self.apply_listening(false)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.is_listening()
    }

    /// User confirmed the escalation prompt.
    pub async fn confirm_emergency(&self) -> Option<DispatchOutcome> {
        let outcome = self.dispatcher.handle_emergency_confirmed().await;
        if let Some(outcome) = &outcome {
            self.emit(CoreEvent::Dispatch(outcome.clone()));
        }
        outcome
    }

    /// User dismissed the escalation prompt.
    pub fn cancel_emergency(&self) -> DispatchOutcome {
        self.accumulator.reset_hits();
        let outcome = self.dispatcher.handle_emergency_cancelled();
        self.emit(CoreEvent::Dispatch(outcome.clone()));
        outcome
    }

    /// Stop the worker. Later feed sends are dropped with a warning.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self, mut feed_rx: mpsc::UnboundedReceiver<RecognizerSignal>) {
        info!("voice_session_worker_started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("voice_session_worker_stopped");
                    return;
                }
                signal = feed_rx.recv() => {
                    let Some(signal) = signal else {
                        info!("voice_session_feed_closed");
                        return;
                    };
                    self.handle_signal(signal).await;
                }
            }
        }
    }

    async fn handle_signal(&self, signal: RecognizerSignal) {
        match signal {
            RecognizerSignal::TextDetected(text) => self.handle_text(&text).await,
            RecognizerSignal::Error(message) => {
                warn!(message = %message, "recognizer_error");
                self.emit(CoreEvent::RecognizerError(message));
            }
            RecognizerSignal::StatusChanged(status) => {
                info!(status = ?status, "recognizer_status");
                self.emit(CoreEvent::Recognizer(status));
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        if !self.listening.is_listening() {
            debug!("utterance ignored while not listening");
            return;
        }

        let snapshot = self.settings.snapshot();
        if snapshot.privacy.store_transcripts {
            debug!(text = %text, "utterance_received");
        } else {
            debug!(len = text.len(), "utterance_received");
        }

        // Hit path first: its dispatch gate is claimed synchronously, so a
        // simultaneous emergency command loses the race instead of firing
        // a second alert.
        if snapshot.commands_enabled {
            tokio::join!(
                self.run_hit_path(text, &snapshot),
                self.run_command_path(text, &snapshot),
            );
        } else {
            self.run_hit_path(text, &snapshot).await;
        }
    }

    async fn run_hit_path(&self, text: &str, snapshot: &VigilSettings) {
        let span = self.metrics.span(metric_names::HIT_EVAL);
        let outcome = self.accumulator.process_text(text);
        span.finish();

        match outcome {
            HitOutcome::Ignored => {}
            HitOutcome::Armed(status) => {
                self.emit(CoreEvent::Hit(status.clone()));
                let confirmation = self.dispatcher.handle_single_hit(status.clone());
                self.emit(CoreEvent::Dispatch(confirmation));
                if snapshot.voice_feedback.enabled {
                    self.speak(
                        &format!("Hit {} of {}", status.count, status.required),
                        snapshot,
                    )
                    .await;
                }
            }
            HitOutcome::Escalated(status) => {
                self.emit(CoreEvent::Hit(status));
                match self.dispatcher.handle_emergency().await {
                    Some(outcome) => self.emit(CoreEvent::Dispatch(outcome)),
                    None => warn!("threshold escalation dropped, dispatch already in flight"),
                }
            }
        }
    }

    async fn run_command_path(&self, text: &str, snapshot: &VigilSettings) {
        let outcome = self.engine.process_voice_input(text).await;

        match &outcome {
            CommandOutcome::StopListening { .. } => {
                self.apply_listening(false);
            }
            CommandOutcome::StartListening { .. } => {
                self.apply_listening(true);
            }
            _ => {}
        }

        if snapshot.voice_feedback.enabled {
            if let Some(message) = outcome.spoken_message() {
                self.speak(message, snapshot).await;
            }
        }
        self.emit(CoreEvent::Command(outcome));
    }

    fn apply_listening(&self, on: bool) -> bool {
        if self.listening.set(on) {
            info!(listening = on, "listening_changed");
            self.emit(CoreEvent::ListeningChanged(on));
            true
        } else {
            false
        }
    }

    async fn speak(&self, text: &str, snapshot: &VigilSettings) {
        let options = SpeakOptions::from_settings(&snapshot.voice_feedback);
        let span = self.metrics.span(metric_names::SPEAK);
        if let Err(e) = self.speech.speak(text, &options).await {
            debug!(error = %e, "voice feedback failed");
        }
        span.finish();
    }

    fn emit(&self, event: CoreEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStore;
    use crate::store::MemoryStore;
    use crate::testutil::{FakeAlertApi, FakeLocation, RecordingNotifier, RecordingSpeaker};
    use std::time::Duration;

    struct Harness {
        session: Arc<VoiceSession>,
        events: mpsc::UnboundedReceiver<CoreEvent>,
        settings: Arc<SettingsStore>,
        alerts: Arc<FakeAlertApi>,
        speaker: Arc<RecordingSpeaker>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::load(MemoryStore::new()).await;
        let alerts = FakeAlertApi::new();
        let speaker = RecordingSpeaker::new();
        let history = HistoryStore::open(&dir.path().join("history.db")).unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(EscalationDispatcher::new(
            alerts.clone(),
            FakeLocation::with_fix(),
            RecordingNotifier::new(),
            history.clone(),
            metrics.clone(),
        ));
        let accumulator = Arc::new(HitAccumulator::new(settings.clone()));
        let listening = ListeningState::new();
        let engine = Arc::new(CommandEngine::new(
            settings.clone(),
            dispatcher.clone(),
            accumulator.clone(),
            alerts.clone(),
            FakeLocation::with_fix(),
            history,
            metrics.clone(),
            listening.clone(),
        ));
        let session = VoiceSession::new(
            settings.clone(),
            accumulator,
            engine,
            dispatcher,
            speaker.clone(),
            metrics,
            listening,
        );
        let events = session.take_events().unwrap();
        Harness {
            session,
            events,
            settings,
            alerts,
            speaker,
            _dir: dir,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<CoreEvent>) -> CoreEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn assert_no_events(events: &mut mpsc::UnboundedReceiver<CoreEvent>) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let mut h = harness().await;

        assert!(h.session.start_listening());
        assert!(matches!(
            next_event(&mut h.events).await,
            CoreEvent::ListeningChanged(true)
        ));
        assert!(!h.session.start_listening());

        assert!(h.session.stop_listening());
        assert!(matches!(
            next_event(&mut h.events).await,
            CoreEvent::ListeningChanged(false)
        ));
        assert!(!h.session.stop_listening());
        assert_no_events(&mut h.events).await;
    }

    #[tokio::test]
    async fn utterances_are_dropped_while_stopped() {
        let mut h = harness().await;

        h.session.feed().text_detected("help me");
        assert_no_events(&mut h.events).await;

        h.session.start_listening();
        next_event(&mut h.events).await; // ListeningChanged
        h.session.feed().text_detected("help me");
        assert!(matches!(next_event(&mut h.events).await, CoreEvent::Hit(_)));
    }

    #[tokio::test]
    async fn armed_hit_emits_status_confirmation_and_feedback() {
        let mut h = harness().await;
        h.session.start_listening();
        next_event(&mut h.events).await;

        h.session.feed().text_detected("help me please");

        match next_event(&mut h.events).await {
            CoreEvent::Hit(status) => {
                assert_eq!(status.count, 1);
                assert!(!status.emergency_ready);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut h.events).await {
            CoreEvent::Dispatch(DispatchOutcome::ConfirmationRequested { status }) => {
                assert_eq!(status.count, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Command path reports the non-command utterance.
        match next_event(&mut h.events).await {
            CoreEvent::Command(CommandOutcome::NoMatch { input }) => {
                assert_eq!(input, "help me please");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.speaker.spoken().iter().any(|s| s == "Hit 1 of 3"));
    }

    #[tokio::test]
    async fn threshold_escalation_dispatches_emergency() {
        let mut h = harness().await;
        h.settings
            .update_setting("required_hits", serde_json::json!(1))
            .await
            .unwrap();
        h.session.start_listening();

        h.session.feed().text_detected("help me");

        let mut saw_sent = false;
        for _ in 0..5 {
            match next_event(&mut h.events).await {
                CoreEvent::Dispatch(DispatchOutcome::EmergencySent { alert_id, .. }) => {
                    assert_eq!(alert_id, "alert-1");
                    saw_sent = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_sent);
        assert_eq!(h.alerts.calls(), 1);
    }

    #[tokio::test]
    async fn hit_and_emergency_command_in_one_utterance_dispatch_once() {
        let mut h = harness().await;
        h.settings
            .replace_wake_phrases(&["emergency".to_string()])
            .await
            .unwrap();
        h.settings
            .update_setting("required_hits", serde_json::json!(1))
            .await
            .unwrap();
        let gate = h.alerts.gate_next();
        h.session.start_listening();

        // Counts as a hit (escalates at 1) and matches the emergency
        // command exactly.
        h.session.feed().text_detected("emergency");
        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.notify_one();

        let mut sent = 0;
        let mut failed_busy = 0;
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_millis(500), h.events.recv()).await {
                Ok(Some(CoreEvent::Dispatch(DispatchOutcome::EmergencySent { .. }))) => sent += 1,
                Ok(Some(CoreEvent::Command(CommandOutcome::EmergencyFailed { message }))) => {
                    assert!(message.contains("already in progress"));
                    failed_busy += 1;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert_eq!(sent, 1);
        assert_eq!(failed_busy, 1);
        assert_eq!(h.alerts.calls(), 1);
    }

    #[tokio::test]
    async fn stop_listening_command_pauses_the_session() {
        let mut h = harness().await;
        h.session.start_listening();
        next_event(&mut h.events).await;

        h.session.feed().text_detected("stop listening");

        let mut saw_changed = false;
        let mut saw_command = false;
        for _ in 0..4 {
            match next_event(&mut h.events).await {
                CoreEvent::ListeningChanged(false) => saw_changed = true,
                CoreEvent::Command(CommandOutcome::StopListening { .. }) => {
                    saw_command = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_changed && saw_command);
        assert!(!h.session.is_listening());

        h.session.feed().text_detected("help me");
        assert_no_events(&mut h.events).await;
    }

    #[tokio::test]
    async fn settings_changes_rebuild_commands_and_forward_events() {
        let mut h = harness().await;

        h.settings
            .add_custom_command("walk me home", "checkin", "safety walk")
            .await
            .unwrap();
        match next_event(&mut h.events).await {
            CoreEvent::SettingsChanged { key } => assert_eq!(key, "custom_commands"),
            other => panic!("unexpected event: {other:?}"),
        }

        h.session.start_listening();
        next_event(&mut h.events).await;
        h.session.feed().text_detected("walk me home");

        let mut saw_check_in = false;
        for _ in 0..4 {
            if let CoreEvent::Command(CommandOutcome::CheckInSent { .. }) =
                next_event(&mut h.events).await
            {
                saw_check_in = true;
                break;
            }
        }
        assert!(saw_check_in);
    }

    #[tokio::test]
    async fn recognizer_errors_and_status_are_forwarded() {
        let mut h = harness().await;
        let feed = h.session.feed();

        feed.error("microphone lost");
        match next_event(&mut h.events).await {
            CoreEvent::RecognizerError(message) => assert_eq!(message, "microphone lost"),
            other => panic!("unexpected event: {other:?}"),
        }

        feed.status_changed(RecognizerStatus::Degraded);
        assert!(matches!(
            next_event(&mut h.events).await,
            CoreEvent::Recognizer(RecognizerStatus::Degraded)
        ));
    }

    #[tokio::test]
    async fn confirm_and_cancel_flow_through_the_dispatcher() {
        let mut h = harness().await;
        h.session.start_listening();
        next_event(&mut h.events).await;

        h.session.feed().text_detected("help me");
        next_event(&mut h.events).await; // Hit
        next_event(&mut h.events).await; // ConfirmationRequested
        next_event(&mut h.events).await; // Command(NoMatch)

        let outcome = h.session.confirm_emergency().await;
        assert!(matches!(
            outcome,
            Some(DispatchOutcome::EmergencySent { .. })
        ));
        assert!(matches!(
            next_event(&mut h.events).await,
            CoreEvent::Dispatch(DispatchOutcome::EmergencySent { .. })
        ));

        let outcome = h.session.cancel_emergency();
        assert!(matches!(outcome, DispatchOutcome::Cancelled));
    }

    #[tokio::test]
    async fn cancel_clears_pending_hits() {
        let mut h = harness().await;
        h.session.start_listening();
        next_event(&mut h.events).await;

        h.session.feed().text_detected("help me");
        next_event(&mut h.events).await; // Hit 1

        h.session.cancel_emergency();

        // The next hit starts from one again.
        h.session.feed().text_detected("help me");
        loop {
            if let CoreEvent::Hit(status) = next_event(&mut h.events).await {
                assert_eq!(status.count, 1);
                break;
            }
        }
    }

    #[tokio::test]
    async fn feedback_disabled_stays_silent() {
        let mut h = harness().await;
        h.settings
            .update_setting(
                "voice_feedback",
                serde_json::json!({
                    "enabled": false,
                    "volume": 1.0,
                    "rate": 1.0,
                    "pitch": 1.0,
                    "language": "en-US"
                }),
            )
            .await
            .unwrap();
        h.session.start_listening();

        h.session.feed().text_detected("help me");
        let mut saw_hit = false;
        for _ in 0..5 {
            if let CoreEvent::Hit(_) = next_event(&mut h.events).await {
                saw_hit = true;
                break;
            }
        }
        assert!(saw_hit);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.speaker.spoken().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let mut h = harness().await;
        h.session.start_listening();
        next_event(&mut h.events).await;

        h.session.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.session.feed().text_detected("help me");
        assert_no_events(&mut h.events).await;
    }
}
