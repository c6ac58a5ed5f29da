//! Reactive settings store.
//! One serialized settings object under a single key in the KV store.
//! Every mutation goes through the same gated commit path: build + validate
//! the next object, swap it in memory, persist the whole object, and only
//! then notify listeners. A failed persist returns the error and suppresses
//! notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::normalize::Normalizer;
use crate::commands::registry::is_builtin_phrase;
use crate::store::{KeyValueStore, StoreError};

/// Single logical key holding the whole serialized settings object.
pub const SETTINGS_KEY: &str = "vigil.settings";

/// Full settings schema. Struct-level defaults give additive schema
/// evolution: keys missing from a persisted object fall back per-key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilSettings {
    /// Wake phrases matched by containment against recognized text.
    /// Never empty; stored pre-normalized.
    pub wake_phrases: Vec<String>,
    /// Hits inside the window required to escalate.
    pub required_hits: u32,
    /// Sliding window for hit accumulation, milliseconds.
    pub hit_window_ms: u64,
    /// Master switch for the spoken command path.
    pub commands_enabled: bool,
    pub custom_commands: Vec<CustomCommand>,
    /// User-defined alias -> canonical phrase.
    pub aliases: HashMap<String, String>,
    pub voice_feedback: VoiceFeedback,
    pub recognition: Recognition,
    pub privacy: Privacy,
}

impl Default for VigilSettings {
    fn default() -> Self {
        Self {
            wake_phrases: vec!["help me".to_string()],
            required_hits: 3,
            hit_window_ms: 10_000,
            commands_enabled: true,
            custom_commands: Vec::new(),
            aliases: HashMap::new(),
            voice_feedback: VoiceFeedback::default(),
            recognition: Recognition::default(),
            privacy: Privacy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceFeedback {
    pub enabled: bool,
    pub volume: f32,
    pub rate: f32,
    pub pitch: f32,
    pub language: String,
}

impl Default for VoiceFeedback {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 1.0,
            rate: 1.0,
            pitch: 1.0,
            language: "en-US".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recognition {
    pub sensitivity: f32,
    pub silence_timeout_ms: u64,
}

impl Default for Recognition {
    fn default() -> Self {
        Self {
            sensitivity: 0.5,
            silence_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Privacy {
    /// When false, raw transcripts never reach the logs.
    pub store_transcripts: bool,
    pub share_location: bool,
}

impl Default for Privacy {
    fn default() -> Self {
        Self {
            store_transcripts: false,
            share_location: true,
        }
    }
}

/// A user-defined spoken command persisted in settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCommand {
    pub id: String,
    pub phrase: String,
    /// Action id, e.g. "checkin"; unrecognized ids dispatch as unknown.
    pub action: String,
    pub description: String,
    pub created_at: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug)]
pub enum SettingsError {
    /// Patch referenced a key outside the schema.
    UnknownKey(String),
    /// Value failed to deserialize or broke a settings invariant.
    Invalid(String),
    /// The last remaining wake phrase cannot be removed.
    LastWakePhrase,
    /// Write to the backing store failed; listeners were not notified.
    Persist(StoreError),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::UnknownKey(k) => write!(f, "unknown settings key: {k}"),
            SettingsError::Invalid(e) => write!(f, "invalid settings value: {e}"),
            SettingsError::LastWakePhrase => {
                write!(f, "cannot remove the last wake phrase")
            }
            SettingsError::Persist(e) => write!(f, "settings persist failed: {e}"),
        }
    }
}

impl From<StoreError> for SettingsError {
    fn from(e: StoreError) -> Self {
        SettingsError::Persist(e)
    }
}

type ListenerFn = Box<dyn Fn(&str, &Value, &VigilSettings) + Send + Sync>;

struct ListenerSlot {
    id: u64,
    callback: ListenerFn,
}

type ListenerList = Mutex<Vec<Arc<ListenerSlot>>>;

/// Handle returned by `add_listener`. Dropping it (or calling
/// `unsubscribe`) removes the listener.
pub struct SettingsSubscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl SettingsSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for SettingsSubscription {
    fn drop(&mut self) {
        if let Some(list) = self.listeners.upgrade() {
            list.lock().retain(|slot| slot.id != self.id);
        }
    }
}

pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
    current: RwLock<Arc<VigilSettings>>,
    listeners: Arc<ListenerList>,
    listener_seq: AtomicU64,
    /// Serializes commits: persist-then-notify of one update completes
    /// before the next begins.
    update_gate: tokio::sync::Mutex<()>,
    normalizer: Normalizer,
}

impl SettingsStore {
    /// Read the persisted object and merge it over defaults per-key.
    /// A missing key, unreadable store, or corrupt payload degrades to
    /// defaults with a warning; boot is never blocked on settings.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Arc<Self> {
        let initial = match store.get(SETTINGS_KEY).await {
            Ok(Some(raw)) => merge_over_defaults(&raw),
            Ok(None) => VigilSettings::default(),
            Err(e) => {
                warn!(error = %e, "settings_read_failed_using_defaults");
                VigilSettings::default()
            }
        };
        info!(
            wake_phrases = initial.wake_phrases.len(),
            required_hits = initial.required_hits,
            hit_window_ms = initial.hit_window_ms,
            "settings_loaded"
        );
        Arc::new(Self {
            store,
            current: RwLock::new(Arc::new(initial)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            listener_seq: AtomicU64::new(0),
            update_gate: tokio::sync::Mutex::new(()),
            normalizer: Normalizer::new(),
        })
    }

    /// Cheap whole-object read. Writers swap a fresh Arc, so a held
    /// snapshot is never torn by a concurrent update.
    pub fn snapshot(&self) -> Arc<VigilSettings> {
        Arc::clone(&self.current.read())
    }

    pub fn add_listener<F>(&self, callback: F) -> SettingsSubscription
    where
        F: Fn(&str, &Value, &VigilSettings) + Send + Sync + 'static,
    {
        let id = self.listener_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.lock().push(Arc::new(ListenerSlot {
            id,
            callback: Box::new(callback),
        }));
        SettingsSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub async fn update_setting(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        self.update_settings(single_key(key, value)).await
    }

    pub async fn update_settings(&self, patch: Map<String, Value>) -> Result<(), SettingsError> {
        self.commit_with(move |_, _| Ok(patch)).await
    }

    pub async fn add_wake_phrase(&self, phrase: &str) -> Result<(), SettingsError> {
        let phrase = phrase.to_string();
        self.commit_with(move |snap, normalizer| {
            let normalized = normalizer.apply(&phrase);
            if normalized.is_empty() {
                return Err(SettingsError::Invalid("wake phrase is empty".into()));
            }
            if snap.wake_phrases.contains(&normalized) {
                return Err(SettingsError::Invalid(format!(
                    "wake phrase already present: {normalized}"
                )));
            }
            let mut phrases = snap.wake_phrases.clone();
            phrases.push(normalized);
            Ok(single_key("wake_phrases", json!(phrases)))
        })
        .await
    }

    /// Removing the last remaining phrase is rejected: the accumulator
    /// must always have something to listen for.
    pub async fn remove_wake_phrase(&self, phrase: &str) -> Result<(), SettingsError> {
        let phrase = phrase.to_string();
        self.commit_with(move |snap, normalizer| {
            let normalized = normalizer.apply(&phrase);
            if !snap.wake_phrases.contains(&normalized) {
                return Err(SettingsError::Invalid(format!(
                    "wake phrase not found: {normalized}"
                )));
            }
            if snap.wake_phrases.len() <= 1 {
                return Err(SettingsError::LastWakePhrase);
            }
            let phrases: Vec<String> = snap
                .wake_phrases
                .iter()
                .filter(|p| **p != normalized)
                .cloned()
                .collect();
            Ok(single_key("wake_phrases", json!(phrases)))
        })
        .await
    }

    pub async fn replace_wake_phrases(&self, phrases: &[String]) -> Result<(), SettingsError> {
        let phrases = phrases.to_vec();
        self.commit_with(move |_, normalizer| {
            let mut cleaned: Vec<String> = Vec::new();
            for phrase in &phrases {
                let normalized = normalizer.apply(phrase);
                if !normalized.is_empty() && !cleaned.contains(&normalized) {
                    cleaned.push(normalized);
                }
            }
            if cleaned.is_empty() {
                return Err(SettingsError::Invalid(
                    "wake phrase list cannot be empty".into(),
                ));
            }
            Ok(single_key("wake_phrases", json!(cleaned)))
        })
        .await
    }

    /// Returns the id of the new command.
    pub async fn add_custom_command(
        &self,
        phrase: &str,
        action: &str,
        description: &str,
    ) -> Result<String, SettingsError> {
        let id = Uuid::new_v4().to_string();
        let command_id = id.clone();
        let phrase = phrase.to_string();
        let action = action.trim().to_lowercase();
        let description = description.trim().to_string();
        self.commit_with(move |snap, normalizer| {
            let normalized = normalizer.apply(&phrase);
            if normalized.is_empty() {
                return Err(SettingsError::Invalid("command phrase is empty".into()));
            }
            if is_builtin_phrase(&normalized) {
                return Err(SettingsError::Invalid(format!(
                    "command phrase is built in: {normalized}"
                )));
            }
            if snap.custom_commands.iter().any(|c| c.phrase == normalized) {
                return Err(SettingsError::Invalid(format!(
                    "command phrase already present: {normalized}"
                )));
            }
            let mut commands = snap.custom_commands.clone();
            commands.push(CustomCommand {
                id: command_id,
                phrase: normalized,
                action,
                description,
                created_at: now_unix(),
                enabled: true,
            });
            Ok(single_key("custom_commands", json!(commands)))
        })
        .await?;
        Ok(id)
    }

    pub async fn remove_custom_command(&self, id: &str) -> Result<(), SettingsError> {
        let id = id.to_string();
        self.commit_with(move |snap, _| {
            if !snap.custom_commands.iter().any(|c| c.id == id) {
                return Err(SettingsError::Invalid(format!("command not found: {id}")));
            }
            let commands: Vec<CustomCommand> = snap
                .custom_commands
                .iter()
                .filter(|c| c.id != id)
                .cloned()
                .collect();
            Ok(single_key("custom_commands", json!(commands)))
        })
        .await
    }

    pub async fn set_custom_command_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<(), SettingsError> {
        let id = id.to_string();
        self.commit_with(move |snap, _| {
            if !snap.custom_commands.iter().any(|c| c.id == id) {
                return Err(SettingsError::Invalid(format!("command not found: {id}")));
            }
            let commands: Vec<CustomCommand> = snap
                .custom_commands
                .iter()
                .cloned()
                .map(|mut c| {
                    if c.id == id {
                        c.enabled = enabled;
                    }
                    c
                })
                .collect();
            Ok(single_key("custom_commands", json!(commands)))
        })
        .await
    }

    /// An existing alias is silently overwritten, matching command
    /// re-registration semantics.
    pub async fn add_alias(&self, alias: &str, canonical: &str) -> Result<(), SettingsError> {
        let alias = alias.to_string();
        let canonical = canonical.to_string();
        self.commit_with(move |snap, normalizer| {
            let alias = normalizer.apply(&alias);
            let canonical = normalizer.apply(&canonical);
            if alias.is_empty() || canonical.is_empty() {
                return Err(SettingsError::Invalid("alias and phrase required".into()));
            }
            if alias == canonical {
                return Err(SettingsError::Invalid("alias equals its phrase".into()));
            }
            let mut aliases = snap.aliases.clone();
            aliases.insert(alias, canonical);
            Ok(single_key("aliases", json!(aliases)))
        })
        .await
    }

    pub async fn remove_alias(&self, alias: &str) -> Result<(), SettingsError> {
        let alias = alias.to_string();
        self.commit_with(move |snap, normalizer| {
            let alias = normalizer.apply(&alias);
            if !snap.aliases.contains_key(&alias) {
                return Err(SettingsError::Invalid(format!("alias not found: {alias}")));
            }
            let mut aliases = snap.aliases.clone();
            aliases.remove(&alias);
            Ok(single_key("aliases", json!(aliases)))
        })
        .await
    }

    /// The single commit path. The gate serializes updates; the closure
    /// builds a top-level-key patch from the current snapshot; the merged
    /// object is validated, swapped in memory, persisted whole, and only
    /// after a successful persist are listeners notified per changed key.
    async fn commit_with<F>(&self, build: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&VigilSettings, &Normalizer) -> Result<Map<String, Value>, SettingsError>,
    {
        let _gate = self.update_gate.lock().await;
        let snap = self.snapshot();
        let patch = build(&snap, &self.normalizer)?;
        if patch.is_empty() {
            return Ok(());
        }

        let mut merged = serde_json::to_value(&*snap)
            .map_err(|e| SettingsError::Invalid(format!("serialize settings: {e}")))?;
        let fields = merged
            .as_object_mut()
            .ok_or_else(|| SettingsError::Invalid("settings is not an object".into()))?;
        for (key, value) in &patch {
            if !fields.contains_key(key) {
                return Err(SettingsError::UnknownKey(key.clone()));
            }
            fields.insert(key.clone(), value.clone());
        }
        let next: VigilSettings = serde_json::from_value(merged)
            .map_err(|e| SettingsError::Invalid(format!("patch rejected: {e}")))?;
        validate(&next)?;
        let next = Arc::new(next);

        *self.current.write() = Arc::clone(&next);

        let payload = serde_json::to_string(&*next)
            .map_err(|e| SettingsError::Invalid(format!("serialize settings: {e}")))?;
        self.store.set(SETTINGS_KEY, &payload).await?;

        let keys: Vec<&String> = patch.keys().collect();
        debug!(keys = ?keys, "settings_updated");
        for (key, value) in &patch {
            self.notify(key, value, &next);
        }
        Ok(())
    }

    /// Listener panics are isolated; remaining listeners still run.
    fn notify(&self, key: &str, value: &Value, full: &VigilSettings) {
        let slots: Vec<Arc<ListenerSlot>> = self.listeners.lock().iter().cloned().collect();
        for slot in slots {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (slot.callback)(key, value, full)
            }));
            if outcome.is_err() {
                warn!(listener = slot.id, key, "settings_listener_panicked");
            }
        }
    }
}

fn validate(settings: &VigilSettings) -> Result<(), SettingsError> {
    if settings.wake_phrases.is_empty() {
        return Err(SettingsError::Invalid("wake_phrases cannot be empty".into()));
    }
    if settings.required_hits == 0 {
        return Err(SettingsError::Invalid("required_hits must be at least 1".into()));
    }
    Ok(())
}

/// Overlay a persisted JSON object onto defaults, key by key. Keys the
/// schema no longer knows are dropped; a payload that fails to parse at
/// all degrades to pure defaults. Values that break a settings invariant
/// are reset to their defaults, keeping the rest of the payload.
fn merge_over_defaults(raw: &str) -> VigilSettings {
    let persisted: Map<String, Value> = match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!("settings_payload_corrupt_using_defaults");
            return VigilSettings::default();
        }
    };
    let mut merged = match serde_json::to_value(VigilSettings::default()) {
        Ok(Value::Object(map)) => map,
        _ => return VigilSettings::default(),
    };
    for (key, value) in persisted {
        if merged.contains_key(&key) {
            merged.insert(key, value);
        }
    }
    match serde_json::from_value(Value::Object(merged)) {
        Ok(settings) => repair(settings),
        Err(e) => {
            warn!(error = %e, "settings_merge_failed_using_defaults");
            VigilSettings::default()
        }
    }
}

/// A persisted payload bypasses commit-time validation, so the load path
/// resets any key that breaks a settings invariant instead of dropping
/// the whole object.
fn repair(mut settings: VigilSettings) -> VigilSettings {
    if validate(&settings).is_ok() {
        return settings;
    }
    let defaults = VigilSettings::default();
    if settings.wake_phrases.is_empty() {
        warn!("persisted_wake_phrases_empty_using_default");
        settings.wake_phrases = defaults.wake_phrases;
    }
    if settings.required_hits == 0 {
        warn!(
            required_hits = defaults.required_hits,
            "persisted_required_hits_invalid_using_default"
        );
        settings.required_hits = defaults.required_hits;
    }
    settings
}

fn single_key(key: &str, value: Value) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(key.to_string(), value);
    patch
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
