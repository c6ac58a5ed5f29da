//! Vigil: hands-free safety escalation core.
//! Wake-phrase monitoring, spoken commands, and single-flight emergency
//! dispatch behind one event stream.

pub mod metrics;
pub mod store;
pub mod settings;
pub mod trigger;
pub mod commands;
pub mod alerts;
pub mod location;
pub mod notify;
pub mod speech;
pub mod history;
pub mod dispatch;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use alerts::{AlertApi, HttpAlertClient};
use commands::CommandEngine;
use dispatch::EscalationDispatcher;
use history::HistoryStore;
use location::{CommandLocationProvider, LocationProvider};
use metrics::MetricsRegistry;
use notify::{CommandNotifier, NotificationSink};
use session::{ListeningState, VoiceSession};
use settings::SettingsStore;
use speech::{CommandSpeaker, SpeechSynth};
use store::{KeyValueStore, SqliteStore};
use trigger::HitAccumulator;

/// Initialize tracing. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=debug".parse().unwrap()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// External capabilities the core runs against. `default_collaborators`
/// fills these with the shipped adapters; embedders inject their own.
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub alerts: Arc<dyn AlertApi>,
    pub location: Arc<dyn LocationProvider>,
    pub notifier: Arc<dyn NotificationSink>,
    pub speech: Arc<dyn SpeechSynth>,
}

/// The assembled core. The session carries the event stream; the
/// dispatcher is exposed for status queries.
pub struct SafetyCore {
    pub settings: Arc<SettingsStore>,
    pub session: Arc<VoiceSession>,
    pub dispatcher: Arc<EscalationDispatcher>,
    pub history: Arc<HistoryStore>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Shipped adapter set: sqlite settings store, HTTP alert client
/// configured from the environment, helper commands for location,
/// notifications, and speech. Helper availability is probed at
/// construction; a missing helper degrades that capability, it does not
/// fail the boot.
pub fn default_collaborators(data_dir: &Path) -> Result<Collaborators, String> {
    let store = SqliteStore::open(&data_dir.join("settings.db"))
        .map_err(|e| format!("settings store: {e}"))?;
    let alerts = HttpAlertClient::from_env().map_err(|e| format!("alert client: {e}"))?;

    Ok(Collaborators {
        store,
        alerts: Arc::new(alerts),
        location: Arc::new(CommandLocationProvider::new("termux-location", &[])),
        notifier: Arc::new(CommandNotifier::new("notify-send")),
        speech: Arc::new(CommandSpeaker::new("espeak-ng")),
    })
}

/// Wire the core. `data_dir` holds the history database; the settings
/// store arrives through the collaborators.
pub async fn bootstrap(
    data_dir: &Path,
    collaborators: Collaborators,
) -> Result<SafetyCore, String> {
    let settings = SettingsStore::load(collaborators.store).await;

    let history =
        HistoryStore::open(&data_dir.join("history.db")).map_err(|e| format!("history store: {e}"))?;

    let metrics = Arc::new(MetricsRegistry::new());
    let dispatcher = Arc::new(EscalationDispatcher::new(
        Arc::clone(&collaborators.alerts),
        Arc::clone(&collaborators.location),
        Arc::clone(&collaborators.notifier),
        Arc::clone(&history),
        Arc::clone(&metrics),
    ));
    let accumulator = Arc::new(HitAccumulator::new(Arc::clone(&settings)));
    let listening = ListeningState::new();
    let engine = Arc::new(CommandEngine::new(
        Arc::clone(&settings),
        Arc::clone(&dispatcher),
        Arc::clone(&accumulator),
        Arc::clone(&collaborators.alerts),
        Arc::clone(&collaborators.location),
        Arc::clone(&history),
        Arc::clone(&metrics),
        Arc::clone(&listening),
    ));
    let session = VoiceSession::new(
        Arc::clone(&settings),
        accumulator,
        engine,
        Arc::clone(&dispatcher),
        Arc::clone(&collaborators.speech),
        Arc::clone(&metrics),
        listening,
    );

    info!("vigil core ready");
    Ok(SafetyCore {
        settings,
        session,
        dispatcher,
        history,
        metrics,
    })
}
