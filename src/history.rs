//! Alert history persistence with async batch writing.
//! Dispatch outcomes are buffered in a channel and flushed to SQLite in
//! batches, so the escalation path is never blocked by disk I/O.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::AlertKind;
use crate::store::StoreError;

/// Terminal state of one alert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Sent,
    Failed,
    Cancelled,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Sent => "sent",
            RecordOutcome::Failed => "failed",
            RecordOutcome::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "sent" => RecordOutcome::Sent,
            "cancelled" => RecordOutcome::Cancelled,
            _ => RecordOutcome::Failed,
        }
    }
}

/// One alert attempt as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub record_id: String,
    pub kind: AlertKind,
    pub outcome: RecordOutcome,
    /// Backend id, present only when submission succeeded.
    pub alert_id: Option<String>,
    pub message: String,
    pub created_at: i64,
}

impl AlertRecord {
    pub fn new(
        kind: AlertKind,
        outcome: RecordOutcome,
        alert_id: Option<String>,
        message: &str,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            kind,
            outcome,
            alert_id,
            message: message.to_string(),
            created_at: now_unix(),
        }
    }
}

/// Async history store: accepts records via channel, flushes to SQLite in
/// batches from a background task.
pub struct HistoryStore {
    tx: mpsc::UnboundedSender<AlertRecord>,
    /// Direct connection for queries.
    read_conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the history database and start the flush task.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, StoreError> {
        let read_conn = Connection::open(db_path)
            .map_err(|e| StoreError::Open(format!("failed to open history db: {e}")))?;

        read_conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Open(format!("PRAGMA failed: {e}")))?;

        read_conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS alert_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    record_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    alert_id TEXT,
                    message TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_alert_history_created
                    ON alert_history(created_at);",
            )
            .map_err(|e| StoreError::Open(format!("create history table failed: {e}")))?;

        // Separate write connection so batch flushes never hold up queries.
        let write_conn = Connection::open(db_path)
            .map_err(|e| StoreError::Open(format!("failed to open history db writer: {e}")))?;
        write_conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Open(format!("PRAGMA write conn: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            tx,
            read_conn: Mutex::new(read_conn),
        });
        tokio::spawn(flush_loop(rx, write_conn));

        info!(path = %db_path.display(), "alert_history_opened");
        Ok(store)
    }

    /// Queue a record for async batch write. Never blocks.
    pub fn record(&self, entry: AlertRecord) {
        if let Err(e) = self.tx.send(entry) {
            warn!(error = %e, "history channel send failed (receiver dropped?)");
        }
    }

    /// Recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertRecord> {
        let conn = self.read_conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT record_id, kind, outcome, alert_id, message, created_at
             FROM alert_history ORDER BY created_at DESC, id DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "history query prepare failed");
                return Vec::new();
            }
        };

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let kind: String = row.get(1)?;
                let outcome: String = row.get(2)?;
                Ok(AlertRecord {
                    record_id: row.get(0)?,
                    kind: parse_kind(&kind),
                    outcome: RecordOutcome::parse(&outcome),
                    alert_id: row.get(3)?,
                    message: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .ok();

        match rows {
            Some(iter) => iter.filter_map(|r| r.ok()).collect(),
            None => Vec::new(),
        }
    }

    /// Delete records older than the given number of days.
    pub fn cleanup_older_than_days(&self, days: u32) -> usize {
        let conn = self.read_conn.lock();
        let cutoff = now_unix() - (days as i64 * 86400);
        match conn.execute(
            "DELETE FROM alert_history WHERE created_at <= ?1",
            params![cutoff],
        ) {
            Ok(count) => {
                if count > 0 {
                    info!(removed = count, days, "alert_history_cleanup");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "history cleanup failed");
                0
            }
        }
    }
}

fn parse_kind(s: &str) -> AlertKind {
    match s {
        "check_in" => AlertKind::CheckIn,
        "location_share" => AlertKind::LocationShare,
        _ => AlertKind::Emergency,
    }
}

/// Collect records from the channel and batch-insert every 250ms.
async fn flush_loop(mut rx: mpsc::UnboundedReceiver<AlertRecord>, conn: Connection) {
    let flush_interval = Duration::from_millis(250);
    let mut buffer: Vec<AlertRecord> = Vec::with_capacity(16);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            msg = rx.recv() => {
                match msg {
                    Some(record) => buffer.push(record),
                    None => {
                        if !buffer.is_empty() {
                            flush_batch(&conn, &buffer);
                        }
                        info!("history flush loop exiting (channel closed)");
                        return;
                    }
                }
            }
        }

        while let Ok(record) = rx.try_recv() {
            buffer.push(record);
        }

        if !buffer.is_empty() {
            flush_batch(&conn, &buffer);
            buffer.clear();
        }
    }
}

/// Batch-insert within one transaction.
fn flush_batch(conn: &Connection, records: &[AlertRecord]) {
    let start = std::time::Instant::now();

    if let Err(e) = conn.execute_batch("BEGIN TRANSACTION") {
        warn!(error = %e, "history batch begin failed");
        return;
    }

    let mut stmt = match conn.prepare_cached(
        "INSERT INTO alert_history
         (record_id, kind, outcome, alert_id, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "history batch prepare failed");
            let _ = conn.execute_batch("ROLLBACK");
            return;
        }
    };

    for record in records {
        if let Err(e) = stmt.execute(params![
            record.record_id,
            record.kind.as_str(),
            record.outcome.as_str(),
            record.alert_id,
            record.message,
            record.created_at,
        ]) {
            warn!(error = %e, "history insert failed for record_id={}", record.record_id);
        }
    }

    drop(stmt);

    if let Err(e) = conn.execute_batch("COMMIT") {
        warn!(error = %e, "history batch commit failed");
    } else {
        debug!(
            count = records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "history_batch_flushed"
        );
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_flush_and_query_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).unwrap();

        store.record(AlertRecord::new(
            AlertKind::CheckIn,
            RecordOutcome::Sent,
            Some("a-1".into()),
            "Check-in sent",
        ));
        store.record(AlertRecord::new(
            AlertKind::Emergency,
            RecordOutcome::Failed,
            None,
            "location unavailable",
        ));

        tokio::time::sleep(Duration::from_millis(800)).await;

        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, AlertKind::Emergency);
        assert_eq!(recent[0].outcome, RecordOutcome::Failed);
        assert!(recent[0].alert_id.is_none());
        assert_eq!(recent[1].alert_id.as_deref(), Some("a-1"));
    }

    #[tokio::test]
    async fn cleanup_removes_aged_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).unwrap();

        store.record(AlertRecord::new(
            AlertKind::Emergency,
            RecordOutcome::Sent,
            Some("a-2".into()),
            "Emergency alert sent",
        ));
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(store.cleanup_older_than_days(0), 1);
        assert!(store.recent(10).is_empty());
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).unwrap();

        for i in 0..5 {
            store.record(AlertRecord::new(
                AlertKind::CheckIn,
                RecordOutcome::Sent,
                Some(format!("a-{i}")),
                "Check-in sent",
            ));
        }
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.recent(3).len(), 3);
    }
}
