//! Wake-phrase hit accumulation.
//! Counts containment hits inside a sliding time window; at the configured
//! threshold it escalates exactly once and clears itself. Pruning is lazy:
//! no background timers, every evaluation prunes before it counts.
//! Matching is substring containment only; anything fuzzier belongs to the
//! command matcher, not the escalation path.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::commands::normalize::Normalizer;
use crate::settings::{SettingsStore, VigilSettings};

/// Accumulator phase. `Escalated` is transient: it is observed only in the
/// outcome of the call that crossed the threshold, after which the
/// accumulator is already back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Idle,
    Armed,
    Escalated,
}

/// Point-in-time view of hit accumulation.
#[derive(Debug, Clone, Serialize)]
pub struct HitStatus {
    /// `Escalated` only in the status captured at the crossing;
    /// `hit_status` reads derive `Idle` or `Armed` from the live count.
    pub state: TriggerState,
    pub count: usize,
    pub required: u32,
    /// Milliseconds until the oldest hit leaves the window; 0 with no hits.
    pub time_left_ms: u64,
    /// `count / required`, capped at 1.0.
    pub progress: f64,
    pub emergency_ready: bool,
}

/// Classification of one utterance.
#[derive(Debug, Clone)]
pub enum HitOutcome {
    /// No wake phrase present, or empty text.
    Ignored,
    /// Sub-threshold hit recorded. Emitted on every such hit, not only the
    /// first.
    Armed(HitStatus),
    /// Threshold crossed. The status is captured at the crossing; the
    /// record list is already cleared when this returns, so a crossing can
    /// never fire twice.
    Escalated(HitStatus),
}

/// Sliding-window accumulator over wake-phrase hits.
/// Configuration is read from the settings snapshot on every call, so
/// phrase, threshold, and window changes apply from the next utterance
/// without re-evaluating already-recorded hits.
pub struct HitAccumulator {
    settings: Arc<SettingsStore>,
    /// Hit timestamps, epoch milliseconds, insertion order.
    hits: Mutex<Vec<u64>>,
    normalizer: Normalizer,
}

impl HitAccumulator {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            hits: Mutex::new(Vec::new()),
            normalizer: Normalizer::new(),
        }
    }

    /// Classify one recognized utterance. Append, prune, and evaluate run
    /// under one lock so a concurrent status read never sees a torn count.
    pub fn process_text(&self, text: &str) -> HitOutcome {
        self.process_text_at(text, now_ms())
    }

    fn process_text_at(&self, text: &str, now: u64) -> HitOutcome {
        let normalized = self.normalizer.apply(text);
        if normalized.is_empty() {
            return HitOutcome::Ignored;
        }
        let snap = self.settings.snapshot();
        // One hit per utterance, no matter how many phrases it contains.
        let matched = snap.wake_phrases.iter().any(|p| {
            let phrase = self.normalizer.apply(p);
            !phrase.is_empty() && normalized.contains(&phrase)
        });
        if !matched {
            return HitOutcome::Ignored;
        }

        let mut hits = self.hits.lock();
        hits.push(now);
        prune(&mut hits, now, snap.hit_window_ms);
        let count = hits.len();
        if count >= snap.required_hits as usize {
            let status = status_from(&hits, now, &snap, TriggerState::Escalated);
            hits.clear();
            info!(count, required = snap.required_hits, "hit_threshold_escalated");
            HitOutcome::Escalated(status)
        } else {
            debug!(count, required = snap.required_hits, "hit_recorded");
            HitOutcome::Armed(status_from(&hits, now, &snap, TriggerState::Armed))
        }
    }

    /// Current status, pruning first.
    pub fn hit_status(&self) -> HitStatus {
        self.hit_status_at(now_ms())
    }

    fn hit_status_at(&self, now: u64) -> HitStatus {
        let snap = self.settings.snapshot();
        let mut hits = self.hits.lock();
        prune(&mut hits, now, snap.hit_window_ms);
        let state = if hits.is_empty() {
            TriggerState::Idle
        } else {
            TriggerState::Armed
        };
        status_from(&hits, now, &snap, state)
    }

    pub fn state(&self) -> TriggerState {
        self.hit_status().state
    }

    /// Unconditional clear.
    pub fn reset_hits(&self) {
        let mut hits = self.hits.lock();
        if !hits.is_empty() {
            debug!(cleared = hits.len(), "hits_reset");
        }
        hits.clear();
    }
}

/// Drop records strictly older than the window; age == window stays.
fn prune(hits: &mut Vec<u64>, now: u64, window_ms: u64) {
    hits.retain(|&t| now.saturating_sub(t) <= window_ms);
}

fn status_from(hits: &[u64], now: u64, snap: &VigilSettings, state: TriggerState) -> HitStatus {
    let count = hits.len();
    let required = snap.required_hits;
    let time_left_ms = hits
        .first()
        .map(|&oldest| snap.hit_window_ms.saturating_sub(now.saturating_sub(oldest)))
        .unwrap_or(0);
    // required_hits >= 1 is enforced by settings validation.
    let progress = (count as f64 / required as f64).min(1.0);
    HitStatus {
        state,
        count,
        required,
        time_left_ms,
        progress,
        emergency_ready: count >= required as usize,
    }
}

/// Current time as epoch milliseconds.
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
