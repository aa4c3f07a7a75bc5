//! Idempotency ledger: transaction_id -> recorded outcome.
//!
//! At-least-once delivery means every transaction can arrive more than
//! once; the ledger is what keeps a redelivered sale from decrementing
//! stock twice. Check-then-act runs under the per-branch lock, and the
//! PRIMARY KEY on `transaction_id` is the backstop if that serialization
//! is ever bypassed: `record` reports a conflict instead of overwriting,
//! and the caller returns the stored outcome.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::protocol::{TransactionOutcome, TransactionResult};

/// Default retention. Branches can stay offline for extended periods, so
/// entries must outlive any realistic redelivery window.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Look up a previously recorded outcome. `None` means the transaction has
/// never terminally applied here.
pub fn try_get_outcome(
    conn: &Connection,
    transaction_id: &str,
) -> rusqlite::Result<Option<TransactionResult>> {
    conn.query_row(
        "SELECT outcome, result_entity_id, discrepancy_details, error_message
         FROM sync_ledger
         WHERE transaction_id = ?1",
        params![transaction_id],
        |row| {
            let outcome_raw: String = row.get(0)?;
            let details_raw: Option<String> = row.get(2)?;
            Ok(TransactionResult {
                transaction_id: transaction_id.to_string(),
                outcome: TransactionOutcome::parse(&outcome_raw)
                    .unwrap_or(TransactionOutcome::Applied),
                result_entity_id: row.get(1)?,
                discrepancy_details: details_raw
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default(),
                error_message: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Record a terminal outcome. Returns `false` when an entry already exists
/// for this transaction_id. The caller must treat that as "someone else
/// already applied it" and re-read the stored outcome instead of trusting
/// its own.
pub fn record(conn: &Connection, result: &TransactionResult) -> rusqlite::Result<bool> {
    debug_assert!(result.outcome.is_terminal());
    let details = if result.discrepancy_details.is_empty() {
        None
    } else {
        serde_json::to_string(&result.discrepancy_details).ok()
    };
    let inserted = conn.execute(
        "INSERT INTO sync_ledger
            (transaction_id, outcome, result_entity_id, discrepancy_details, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(transaction_id) DO NOTHING",
        params![
            result.transaction_id,
            result.outcome.as_str(),
            result.result_entity_id,
            details,
            result.error_message,
        ],
    )?;
    Ok(inserted > 0)
}

/// Time-bounded pruning. Never called from the request path; the server
/// host schedules it.
pub fn prune(conn: &Connection, retention_days: i64) -> rusqlite::Result<usize> {
    let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).to_rfc3339();
    let pruned = conn.execute(
        "DELETE FROM sync_ledger WHERE julianday(recorded_at) <= julianday(?1)",
        params![cutoff],
    )?;
    if pruned > 0 {
        info!(pruned, retention_days, "Pruned idempotency ledger entries");
    }
    Ok(pruned)
}
