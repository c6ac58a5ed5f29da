//! Alert submission: the outbound contract for emergencies, check-ins, and
//! location shares. The production client posts to the companion backend;
//! everything upstream only sees the trait.

pub mod http;

pub use http::HttpAlertClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::location::LocationFix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Emergency,
    CheckIn,
    LocationShare,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Emergency => "emergency",
            AlertKind::CheckIn => "check_in",
            AlertKind::LocationShare => "location_share",
        }
    }
}

/// Outbound alert payload. The wire key for the kind is `type`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRequest {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub location: Option<LocationFix>,
}

/// Backend acknowledgement for a submitted alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertReceipt {
    pub alert_id: String,
    pub created_at: i64,
}

#[derive(Debug)]
pub enum AlertError {
    ApiError(String),
    RateLimited { retry_after_ms: u64 },
    Timeout,
    InvalidResponse(String),
}

impl std::fmt::Display for AlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertError::ApiError(msg) => write!(f, "alert API error: {msg}"),
            AlertError::RateLimited { retry_after_ms } => {
                write!(f, "alert API rate limited, retry after {retry_after_ms}ms")
            }
            AlertError::Timeout => write!(f, "alert submission timeout"),
            AlertError::InvalidResponse(msg) => write!(f, "alert API bad response: {msg}"),
        }
    }
}

/// Alert submission seam. Implementations must be safe to call from
/// concurrent tasks; the dispatcher's single-flight gate only covers the
/// emergency path.
#[async_trait]
pub trait AlertApi: Send + Sync {
    async fn create_alert(&self, request: &AlertRequest) -> Result<AlertReceipt, AlertError>;
}
