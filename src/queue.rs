//! Durable transaction queue for the branch terminal.
//!
//! Every domain write action (sale, purchase, expense, stock adjustment)
//! is enqueued here first, online or offline. The row is persisted before
//! the caller is told the action succeeded: while the terminal is offline
//! this row is the only record of the sale. The sync dispatcher is the
//! only writer after enqueue; the UI reads counts and the failed-item
//! review list.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::protocol::TransactionKind;

/// Lifecycle status of a queue record.
///
/// Transitions: Pending -> Syncing -> {Completed | Pending (retry) |
/// Failed (terminal)}. Cleanup removes Completed rows after a retention
/// window; nothing else deletes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(QueueStatus::Pending),
            "syncing" => Some(QueueStatus::Syncing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// One durable unit of work. `id` is immutable, globally unique per branch,
/// and doubles as the server-side idempotency key. `payload` is never
/// mutated after creation; corrections require a new record.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub id: String,
    pub kind: TransactionKind,
    pub payload: Value,
    pub created_at: String,
    pub status: QueueStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<String>,
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRecord> {
    let kind_raw: String = row.get(1)?;
    let status_raw: String = row.get(4)?;
    let payload_raw: String = row.get(2)?;
    Ok(QueueRecord {
        id: row.get(0)?,
        kind: TransactionKind::parse(&kind_raw).unwrap_or(TransactionKind::Sale),
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
        created_at: row.get(3)?,
        status: QueueStatus::parse(&status_raw).unwrap_or(QueueStatus::Pending),
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        next_retry_at: row.get(7)?,
    })
}

const RECORD_COLUMNS: &str =
    "id, record_type, payload, created_at, status, attempts, last_error, next_retry_at";

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Append a new record. Persisted immediately, not batched: a crash right
/// after the caller returns must not lose the row. Storage errors surface
/// to the caller so the UI never reports a sale complete without queue
/// durability confirmed.
pub fn enqueue(db: &DbState, kind: TransactionKind, payload: &Value) -> Result<QueueRecord, String> {
    let record = QueueRecord {
        id: Uuid::new_v4().to_string(),
        kind,
        payload: payload.clone(),
        created_at: Utc::now().to_rfc3339(),
        status: QueueStatus::Pending,
        attempts: 0,
        last_error: None,
        next_retry_at: None,
    };

    let payload_text =
        serde_json::to_string(payload).map_err(|e| format!("serialize payload: {e}"))?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO sync_queue (id, record_type, payload, created_at, status, attempts)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0)",
        params![record.id, kind.as_str(), payload_text, record.created_at],
    )
    .map_err(|e| format!("enqueue {}: {e}", kind.as_str()))?;

    info!(record_id = %record.id, kind = kind.as_str(), "Queued transaction");
    Ok(record)
}

// ---------------------------------------------------------------------------
// ListReady / counts
// ---------------------------------------------------------------------------

/// Pending records whose retry time has passed, oldest first. The rowid
/// tiebreak keeps insertion order for records created within the same
/// timestamp granularity, so two sales against the same product apply in
/// the order the cashier created them.
pub fn list_ready(db: &DbState, limit: i64) -> Result<Vec<QueueRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM sync_queue
             WHERE status = 'pending'
               AND (
                    next_retry_at IS NULL
                    OR julianday(next_retry_at) <= julianday('now')
               )
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?1"
        ))
        .map_err(|e| format!("list ready prepare: {e}"))?;

    let records = stmt
        .query_map(params![limit], record_from_row)
        .map_err(|e| format!("list ready query: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(records)
}

/// Number of records still waiting to reach the server. Backs the UI
/// indicator, so it reads the status index only.
pub fn pending_count(db: &DbState) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'syncing')",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("pending count: {e}"))
}

/// Terminally failed records for the operator review surface, newest first.
pub fn failed_records(db: &DbState, limit: i64) -> Result<Vec<QueueRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM sync_queue
             WHERE status = 'failed'
             ORDER BY created_at DESC
             LIMIT ?1"
        ))
        .map_err(|e| format!("failed records prepare: {e}"))?;

    let records = stmt
        .query_map(params![limit], record_from_row)
        .map_err(|e| format!("failed records query: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(records)
}

// ---------------------------------------------------------------------------
// Status transitions (dispatcher-only after enqueue)
// ---------------------------------------------------------------------------

/// Mark a set of records as in-flight. Atomic across the set.
pub fn mark_syncing(db: &DbState, ids: &[String]) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("mark syncing begin: {e}"))?;
    for id in ids {
        tx.execute(
            "UPDATE sync_queue
             SET status = 'syncing', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )
        .map_err(|e| format!("mark syncing {id}: {e}"))?;
    }
    tx.commit().map_err(|e| format!("mark syncing commit: {e}"))
}

/// The server acknowledged the transaction as applied.
pub fn mark_completed(db: &DbState, id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'completed',
             last_error = NULL,
             completed_at = datetime('now'),
             updated_at = datetime('now')
         WHERE id = ?1",
        params![id],
    )
    .map_err(|e| format!("mark completed {id}: {e}"))?;
    Ok(())
}

/// Transient failure: record the error, bump the attempt counter, and keep
/// the record pending until `next_retry_at`.
pub fn mark_failed_retry(
    db: &DbState,
    id: &str,
    error: &str,
    next_retry_at: &str,
) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'pending',
             attempts = attempts + 1,
             last_error = ?2,
             next_retry_at = ?3,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![id, error, next_retry_at],
    )
    .map_err(|e| format!("mark failed retry {id}: {e}"))?;
    Ok(())
}

/// Terminal failure: the record will never retry automatically. It stays
/// visible in the failed list until an operator requeues or prunes it.
pub fn mark_failed_terminal(db: &DbState, id: &str, error: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'failed',
             attempts = attempts + 1,
             last_error = ?2,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![id, error],
    )
    .map_err(|e| format!("mark failed terminal {id}: {e}"))?;
    warn!(record_id = %id, error, "Queue record failed terminally");
    Ok(())
}

// ---------------------------------------------------------------------------
// Startup recovery and operator requeue
// ---------------------------------------------------------------------------

/// Reset records left in `syncing` by a crashed process back to `pending`.
/// Run once at startup before the dispatcher starts; safe because the
/// server deduplicates redelivery through the idempotency ledger.
pub fn reset_stuck_syncing(db: &DbState) -> Result<usize, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let reset = conn
        .execute(
            "UPDATE sync_queue
             SET status = 'pending', updated_at = datetime('now')
             WHERE status = 'syncing'",
            [],
        )
        .map_err(|e| format!("reset stuck syncing: {e}"))?;
    if reset > 0 {
        warn!(reset, "Reset in-flight queue records left by previous run");
    }
    Ok(reset)
}

/// Operator-initiated retry of one terminally failed record.
pub fn retry_failed(db: &DbState, id: &str) -> Result<bool, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let updated = conn
        .execute(
            "UPDATE sync_queue
             SET status = 'pending',
                 attempts = 0,
                 last_error = NULL,
                 next_retry_at = NULL,
                 updated_at = datetime('now')
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )
        .map_err(|e| format!("retry failed {id}: {e}"))?;
    Ok(updated > 0)
}

/// Operator-initiated retry of every terminally failed record.
pub fn retry_all_failed(db: &DbState) -> Result<usize, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'pending',
             attempts = 0,
             last_error = NULL,
             next_retry_at = NULL,
             updated_at = datetime('now')
         WHERE status = 'failed'",
        [],
    )
    .map_err(|e| format!("retry all failed: {e}"))
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Remove completed records older than the retention window. Pending and
/// failed rows are never pruned here.
pub fn prune_completed(db: &DbState, retention_days: i64) -> Result<usize, String> {
    let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).to_rfc3339();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let pruned = conn
        .execute(
            "DELETE FROM sync_queue
             WHERE status = 'completed'
               AND julianday(COALESCE(completed_at, created_at)) <= julianday(?1)",
            params![cutoff],
        )
        .map_err(|e| format!("prune completed: {e}"))?;
    if pruned > 0 {
        info!(pruned, retention_days, "Pruned completed queue records");
    }
    Ok(pruned)
}

/// Fetch one record by id. Used by tests and the review surface.
pub fn get_record(db: &DbState, id: &str) -> Result<Option<QueueRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        record_from_row,
    )
    .optional()
    .map_err(|e| format!("get record {id}: {e}"))
}
