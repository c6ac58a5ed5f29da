//! HTTP alert client for the companion backend.
//! Connection pooling via reqwest, bounded retries: 429 honors Retry-After,
//! 5xx backs off exponentially, a plain timeout is retried once. The
//! emergency path is latency-sensitive, so the budget stays small.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use super::{AlertApi, AlertError, AlertReceipt, AlertRequest};
use async_trait::async_trait;

pub struct HttpAlertClient {
    http: reqwest::Client,
    api_token: String,
    base_url: String,
}

impl HttpAlertClient {
    pub fn new(base_url: &str, api_token: &str) -> Result<Self, AlertError> {
        if api_token.is_empty() {
            return Err(AlertError::ApiError("alert API token not set".into()));
        }
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AlertError::ApiError(e.to_string()))?;

        Ok(Self {
            http,
            api_token: api_token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Read `VIGIL_ALERT_URL` and `VIGIL_ALERT_TOKEN` from the environment.
    pub fn from_env() -> Result<Self, AlertError> {
        let base_url = std::env::var("VIGIL_ALERT_URL")
            .map_err(|_| AlertError::ApiError("VIGIL_ALERT_URL environment variable not set".into()))?;
        let api_token = std::env::var("VIGIL_ALERT_TOKEN")
            .map_err(|_| AlertError::ApiError("VIGIL_ALERT_TOKEN environment variable not set".into()))?;
        Self::new(&base_url, &api_token)
    }

    /// Send with retry. 429: Retry-After or 1s/2s/4s (max 3). 5xx:
    /// exponential backoff (max 2). Timeout: immediate retry once.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, AlertError> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/api/alerts", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_token))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp);
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= max_429_retries {
                        return Err(AlertError::RateLimited { retry_after_ms: 0 });
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "alert_api_rate_limited");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(AlertError::ApiError(format!(
                            "server error: {}",
                            resp.status()
                        )));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "alert_api_5xx_retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(AlertError::ApiError(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(AlertError::Timeout);
                    }
                    warn!("alert_api_timeout_retrying_once");
                    timeout_retried = true;
                }
                Err(e) => {
                    return Err(AlertError::ApiError(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl AlertApi for HttpAlertClient {
    async fn create_alert(&self, request: &AlertRequest) -> Result<AlertReceipt, AlertError> {
        let body = serde_json::to_value(request)
            .map_err(|e| AlertError::ApiError(format!("serialize alert: {e}")))?;

        let response = self.send_with_retry(&body).await?;
        let envelope: AlertEnvelope = response
            .json()
            .await
            .map_err(|e| AlertError::InvalidResponse(e.to_string()))?;

        if !envelope.success {
            return Err(AlertError::ApiError(
                envelope.message.unwrap_or_else(|| "alert rejected".into()),
            ));
        }
        let alert = envelope
            .data
            .ok_or_else(|| AlertError::InvalidResponse("missing data.alert".into()))?
            .alert;

        info!(alert_id = %alert.id, kind = request.kind.as_str(), "alert_submitted");
        Ok(AlertReceipt {
            alert_id: alert.id,
            created_at: alert.created_at.unwrap_or_else(now_unix),
        })
    }
}

// --- Response envelope ---

#[derive(Deserialize)]
struct AlertEnvelope {
    success: bool,
    data: Option<AlertData>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct AlertData {
    alert: AlertBody,
}

#[derive(Deserialize)]
struct AlertBody {
    id: String,
    created_at: Option<i64>,
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
