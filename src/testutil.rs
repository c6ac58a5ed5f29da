//! Shared fakes for exercising the escalation path without helper
//! processes or network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::alerts::{AlertApi, AlertError, AlertReceipt, AlertRequest};
use crate::location::{LocationError, LocationFix, LocationProvider};
use crate::notify::{NotificationSink, NotifyError};
use crate::speech::{SpeakOptions, SpeechError, SpeechSynth};

/// Alert backend fake: counts calls, captures requests, can fail on demand
/// or hold the next submission until the test releases it.
pub struct FakeAlertApi {
    calls: AtomicUsize,
    requests: Mutex<Vec<AlertRequest>>,
    fail: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeAlertApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            gate: Mutex::new(None),
        })
    }

    /// Every subsequent call fails with this message.
    pub fn fail_with(&self, message: &str) {
        *self.fail.lock() = Some(message.to_string());
    }

    /// The next call blocks until the returned handle is notified.
    pub fn gate_next(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AlertRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AlertApi for FakeAlertApi {
    async fn create_alert(&self, request: &AlertRequest) -> Result<AlertReceipt, AlertError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request.clone());

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(message) = self.fail.lock().clone() {
            return Err(AlertError::ApiError(message));
        }
        Ok(AlertReceipt {
            alert_id: format!("alert-{n}"),
            created_at: 0,
        })
    }
}

/// Location fake with three modes: a fixed position, no position, or a
/// provider failure. Tracks which alert ids started tracking.
pub struct FakeLocation {
    fix: Option<LocationFix>,
    fail: Option<String>,
    tracked: Mutex<Vec<String>>,
}

impl FakeLocation {
    pub fn with_fix() -> Arc<Self> {
        Arc::new(Self {
            fix: Some(LocationFix {
                latitude: 52.5206,
                longitude: 13.4098,
                accuracy: 12.0,
                address: None,
            }),
            fail: None,
            tracked: Mutex::new(Vec::new()),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            fix: None,
            fail: None,
            tracked: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fix: None,
            fail: Some(message.to_string()),
            tracked: Mutex::new(Vec::new()),
        })
    }

    pub fn tracked(&self) -> Vec<String> {
        self.tracked.lock().clone()
    }
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn current_fix(&self) -> Result<Option<LocationFix>, LocationError> {
        if let Some(message) = &self.fail {
            return Err(LocationError::AcquisitionFailed(message.clone()));
        }
        Ok(self.fix.clone())
    }

    async fn start_tracking(&self, alert_id: &str) -> Result<(), LocationError> {
        self.tracked.lock().push(alert_id.to_string());
        Ok(())
    }

    async fn stop_tracking(&self) {}
}

/// Notification fake recording (title, body) pairs.
pub struct RecordingNotifier {
    notes: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notes: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn notes(&self) -> Vec<(String, String)> {
        self.notes.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(
        &self,
        title: &str,
        body: &str,
        _data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Failed("sink disabled".to_string()));
        }
        self.notes.lock().push((title.to_string(), body.to_string()));
        Ok(())
    }
}

/// Speech fake recording spoken text.
pub struct RecordingSpeaker {
    utterances: Mutex<Vec<String>>,
}

impl RecordingSpeaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            utterances: Mutex::new(Vec::new()),
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.utterances.lock().clone()
    }
}

#[async_trait]
impl SpeechSynth for RecordingSpeaker {
    async fn speak(&self, text: &str, _options: &SpeakOptions) -> Result<(), SpeechError> {
        self.utterances.lock().push(text.to_string());
        Ok(())
    }
}
