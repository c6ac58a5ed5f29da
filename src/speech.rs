//! Spoken feedback.
//! Outcome messages are read back to the user when voice feedback is
//! enabled. The shipped adapter maps options onto espeak-ng flags and
//! serializes playback so utterances never overlap.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::settings::VoiceFeedback;

/// Voice parameters for one utterance, derived from settings.
#[derive(Debug, Clone)]
pub struct SpeakOptions {
    pub language: String,
    /// 1.0 = neutral; scaled onto the synthesizer's own range.
    pub pitch: f32,
    pub rate: f32,
    pub volume: f32,
}

impl SpeakOptions {
    pub fn from_settings(feedback: &VoiceFeedback) -> Self {
        Self {
            language: feedback.language.clone(),
            pitch: feedback.pitch,
            rate: feedback.rate,
            volume: feedback.volume,
        }
    }
}

#[derive(Debug)]
pub enum SpeechError {
    Unavailable(String),
    Failed(String),
}

impl std::fmt::Display for SpeechError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeechError::Unavailable(tool) => write!(f, "speech synth unavailable: {tool}"),
            SpeechError::Failed(msg) => write!(f, "speech failed: {msg}"),
        }
    }
}

#[async_trait]
pub trait SpeechSynth: Send + Sync {
    async fn speak(&self, text: &str, options: &SpeakOptions) -> Result<(), SpeechError>;
}

/// espeak-ng style adapter, probed at construction.
pub struct CommandSpeaker {
    command: String,
    available: bool,
    /// One utterance at a time.
    playing: tokio::sync::Mutex<()>,
}

impl CommandSpeaker {
    pub fn new(command: &str) -> Self {
        let available = probe_command(command);
        if available {
            info!(command, "speech_synth_available");
        } else {
            warn!(command, "speech synth not found, voice feedback disabled");
        }
        Self {
            command: command.to_string(),
            available,
            playing: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl SpeechSynth for CommandSpeaker {
    async fn speak(&self, text: &str, options: &SpeakOptions) -> Result<(), SpeechError> {
        if !self.available {
            return Err(SpeechError::Unavailable(self.command.clone()));
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        let _playing = self.playing.lock().await;
        let output = tokio::process::Command::new(&self.command)
            .args(build_args(text, options))
            .output()
            .await
            .map_err(|e| SpeechError::Failed(format!("{} exec failed: {e}", self.command)))?;
        if !output.status.success() {
            return Err(SpeechError::Failed(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }
        debug!(len = text.len(), "spoke_feedback");
        Ok(())
    }
}

/// espeak-ng flag mapping: voice from the language tag, pitch 0-99 around
/// a neutral 50, rate in words/min around 175, amplitude 0-200 around 100.
fn build_args(text: &str, options: &SpeakOptions) -> Vec<String> {
    let voice = options.language.to_lowercase();
    let pitch = (options.pitch * 50.0).clamp(0.0, 99.0) as i32;
    let rate = (options.rate * 175.0).clamp(80.0, 450.0) as i32;
    let amplitude = (options.volume * 100.0).clamp(0.0, 200.0) as i32;
    vec![
        "-v".to_string(),
        voice,
        "-p".to_string(),
        pitch.to_string(),
        "-s".to_string(),
        rate.to_string(),
        "-a".to_string(),
        amplitude.to_string(),
        text.to_string(),
    ]
}

/// Probe whether a command is available on PATH.
fn probe_command(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
