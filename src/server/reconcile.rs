//! Reconciliation of offline transactions against a branch's authoritative
//! store.
//!
//! Conflict resolution for inventory is last-commit-wins: a sale's stock
//! decrement is applied unconditionally, and driving stock negative flags
//! the product instead of rejecting the sale. The transactions being
//! replayed already happened in physical reality (the customer walked out
//! with the product), so "accept and flag" is the only valid resolution;
//! rejecting after the fact is not a business action anyone can take.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{
    DiscrepancyDetail, TransactionEnvelope, TransactionKind, TransactionOutcome, TransactionResult,
};
use crate::server::ledger;
use crate::server::store::BranchDb;

/// Why a transaction could not be applied.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The payload can never apply. Maps to `permanentRejection`.
    #[error("{0}")]
    Rejected(String),
    /// Storage-level failure. Maps to `transientFailure`; the client will
    /// redeliver and the ledger keeps the retry safe.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Batch entry point
// ---------------------------------------------------------------------------

/// Apply a batch in input order against one branch. Items are independent:
/// one item's rejection never aborts the rest, and the result array always
/// matches the input order. The branch lock is held across the whole batch,
/// which is the per-branch single-writer guarantee.
pub fn apply_batch(
    branch: &BranchDb,
    transactions: &[TransactionEnvelope],
) -> Vec<TransactionResult> {
    let mut conn = match branch.conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    transactions
        .iter()
        .map(|envelope| apply_transaction(&mut conn, envelope))
        .collect()
}

/// Apply one transaction: idempotency check, dispatch by type, ledger
/// record, all inside a single SQLite transaction so the domain record,
/// the stock mutation, and the ledger entry commit or roll back together.
pub fn apply_transaction(
    conn: &mut Connection,
    envelope: &TransactionEnvelope,
) -> TransactionResult {
    match try_apply(conn, envelope) {
        Ok(result) => result,
        Err(ApplyError::Rejected(reason)) => {
            warn!(
                transaction_id = %envelope.transaction_id,
                kind = envelope.kind.as_str(),
                reason,
                "Transaction rejected"
            );
            record_rejection(conn, &envelope.transaction_id, reason)
        }
        Err(ApplyError::Storage(e)) => {
            // Not recorded in the ledger: the redelivery must re-execute.
            warn!(
                transaction_id = %envelope.transaction_id,
                error = %e,
                "Transaction hit a storage error; reported transient"
            );
            TransactionResult::transient(&envelope.transaction_id, format!("storage error: {e}"))
        }
    }
}

fn try_apply(
    conn: &mut Connection,
    envelope: &TransactionEnvelope,
) -> Result<TransactionResult, ApplyError> {
    let committed = {
        let tx = conn.transaction()?;

        // A stored outcome is returned verbatim, with no side effects:
        // this is the sole correctness mechanism against at-least-once
        // delivery double-applying a sale.
        if let Some(stored) = ledger::try_get_outcome(&tx, &envelope.transaction_id)? {
            debug!(
                transaction_id = %envelope.transaction_id,
                outcome = stored.outcome.as_str(),
                "Duplicate delivery; returning stored outcome"
            );
            return Ok(stored);
        }

        let result = match envelope.kind {
            TransactionKind::Sale => apply_sale(&tx, envelope)?,
            TransactionKind::Purchase => apply_purchase(&tx, envelope)?,
            TransactionKind::Expense => apply_expense(&tx, envelope)?,
            TransactionKind::InventoryAdjustment => apply_adjustment(&tx, envelope)?,
        };

        if ledger::record(&tx, &result)? {
            tx.commit()?;
            Some(result)
        } else {
            // Lost the ledger race: another delivery applied first. Drop
            // the transaction (rolling back our side effects) and return
            // the winner's outcome.
            None
        }
    };

    match committed {
        Some(result) => Ok(result),
        None => ledger::try_get_outcome(conn, &envelope.transaction_id)?.ok_or_else(|| {
            ApplyError::Storage(rusqlite::Error::QueryReturnedNoRows)
        }),
    }
}

/// Permanent rejections are terminal and therefore ledgered too, so a
/// redelivered bad payload gets the same answer without re-validation.
fn record_rejection(conn: &Connection, transaction_id: &str, reason: String) -> TransactionResult {
    let result = TransactionResult::rejected(transaction_id, reason);
    match ledger::record(conn, &result) {
        Ok(true) => result,
        Ok(false) => ledger::try_get_outcome(conn, transaction_id)
            .ok()
            .flatten()
            .unwrap_or(result),
        Err(e) => {
            warn!(transaction_id, error = %e, "Failed to ledger a rejection");
            result
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SalePayload {
    items: Vec<SaleLine>,
    #[serde(default)]
    total_amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleLine {
    product_id: String,
    quantity: i64,
    #[serde(default)]
    unit_price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchasePayload {
    items: Vec<PurchaseLine>,
    #[serde(default)]
    supplier_name: Option<String>,
    #[serde(default)]
    total_cost: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseLine {
    product_id: String,
    quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpensePayload {
    amount: f64,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustmentPayload {
    product_id: String,
    new_level: i64,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_payload<P: serde::de::DeserializeOwned>(
    kind: TransactionKind,
    raw: &Value,
) -> Result<P, ApplyError> {
    serde_json::from_value(raw.clone())
        .map_err(|e| ApplyError::Rejected(format!("Invalid {} payload: {e}", kind.as_str())))
}

fn read_stock(tx: &Connection, product_id: &str) -> Result<Option<(i64, bool)>, ApplyError> {
    let row = tx
        .query_row(
            "SELECT stock_level, has_discrepancy FROM products WHERE id = ?1",
            params![product_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0)),
        )
        .optional()?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Domain handlers
// ---------------------------------------------------------------------------

/// Sale application, the core conflict-resolution path. Per line item:
/// read stock, decrement unconditionally, flag the product when the result
/// is negative. The sale is persisted whether or not it was flagged.
fn apply_sale(
    tx: &Connection,
    envelope: &TransactionEnvelope,
) -> Result<TransactionResult, ApplyError> {
    let payload: SalePayload = parse_payload(envelope.kind, &envelope.payload)?;
    if payload.items.is_empty() {
        return Err(ApplyError::Rejected("Sale has no line items".to_string()));
    }
    for line in &payload.items {
        if line.product_id.trim().is_empty() {
            return Err(ApplyError::Rejected("Line item missing productId".to_string()));
        }
        if line.quantity <= 0 {
            return Err(ApplyError::Rejected(format!(
                "Invalid quantity {} for product {}",
                line.quantity, line.product_id
            )));
        }
    }

    let mut discrepancies: Vec<DiscrepancyDetail> = Vec::new();
    for line in &payload.items {
        let Some((stock, _flagged)) = read_stock(tx, &line.product_id)? else {
            return Err(ApplyError::Rejected(format!(
                "Unknown product: {}",
                line.product_id
            )));
        };

        let new_level = stock - line.quantity;
        if new_level < 0 {
            tx.execute(
                "UPDATE products
                 SET stock_level = ?2, has_discrepancy = 1, updated_at = datetime('now')
                 WHERE id = ?1",
                params![line.product_id, new_level],
            )?;
            discrepancies.push(DiscrepancyDetail {
                product_id: line.product_id.clone(),
                stock_level: new_level,
            });
        } else {
            tx.execute(
                "UPDATE products
                 SET stock_level = ?2, updated_at = datetime('now')
                 WHERE id = ?1",
                params![line.product_id, new_level],
            )?;
        }
    }

    let sale_id = Uuid::new_v4().to_string();
    let items_json = envelope
        .payload
        .get("items")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "[]".to_string());
    tx.execute(
        "INSERT INTO sales (id, transaction_id, terminal_id, items, total_amount, client_created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            sale_id,
            envelope.transaction_id,
            envelope.payload.get("terminalId").and_then(Value::as_str),
            items_json,
            payload.total_amount,
            envelope.timestamp,
        ],
    )?;

    if discrepancies.is_empty() {
        Ok(TransactionResult::applied(&envelope.transaction_id, sale_id))
    } else {
        Ok(TransactionResult {
            transaction_id: envelope.transaction_id.clone(),
            outcome: TransactionOutcome::AppliedWithDiscrepancy,
            result_entity_id: Some(sale_id),
            discrepancy_details: discrepancies,
            error_message: None,
        })
    }
}

/// Purchase application: unconditional increment. Restocking back to a
/// non-negative level clears the discrepancy flag set by an oversell.
fn apply_purchase(
    tx: &Connection,
    envelope: &TransactionEnvelope,
) -> Result<TransactionResult, ApplyError> {
    let payload: PurchasePayload = parse_payload(envelope.kind, &envelope.payload)?;
    if payload.items.is_empty() {
        return Err(ApplyError::Rejected("Purchase has no line items".to_string()));
    }
    for line in &payload.items {
        if line.product_id.trim().is_empty() || line.quantity <= 0 {
            return Err(ApplyError::Rejected(format!(
                "Invalid purchase line for product {:?}",
                line.product_id
            )));
        }
    }

    for line in &payload.items {
        let Some((stock, _)) = read_stock(tx, &line.product_id)? else {
            return Err(ApplyError::Rejected(format!(
                "Unknown product: {}",
                line.product_id
            )));
        };
        let new_level = stock + line.quantity;
        tx.execute(
            "UPDATE products
             SET stock_level = ?2,
                 has_discrepancy = CASE WHEN ?2 >= 0 THEN 0 ELSE has_discrepancy END,
                 updated_at = datetime('now')
             WHERE id = ?1",
            params![line.product_id, new_level],
        )?;
    }

    let purchase_id = Uuid::new_v4().to_string();
    let items_json = envelope
        .payload
        .get("items")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "[]".to_string());
    tx.execute(
        "INSERT INTO purchases
            (id, transaction_id, terminal_id, supplier_name, items, total_cost, client_created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            purchase_id,
            envelope.transaction_id,
            envelope.payload.get("terminalId").and_then(Value::as_str),
            payload.supplier_name,
            items_json,
            payload.total_cost,
            envelope.timestamp,
        ],
    )?;

    Ok(TransactionResult::applied(
        &envelope.transaction_id,
        purchase_id,
    ))
}

/// Expenses have no inventory effect; they are recorded for the branch
/// ledgers and reported applied.
fn apply_expense(
    tx: &Connection,
    envelope: &TransactionEnvelope,
) -> Result<TransactionResult, ApplyError> {
    let payload: ExpensePayload = parse_payload(envelope.kind, &envelope.payload)?;
    if !payload.amount.is_finite() || payload.amount <= 0.0 {
        return Err(ApplyError::Rejected(format!(
            "Invalid expense amount: {}",
            payload.amount
        )));
    }

    let expense_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO expenses
            (id, transaction_id, terminal_id, category, amount, note, client_created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            expense_id,
            envelope.transaction_id,
            envelope.payload.get("terminalId").and_then(Value::as_str),
            payload.category,
            payload.amount,
            payload.note,
            envelope.timestamp,
        ],
    )?;

    Ok(TransactionResult::applied(
        &envelope.transaction_id,
        expense_id,
    ))
}

/// Stock adjustment: an operator sets the absolute level after a count.
/// Clears the discrepancy flag when the counted level is non-negative; a
/// deliberately negative count stays flagged.
fn apply_adjustment(
    tx: &Connection,
    envelope: &TransactionEnvelope,
) -> Result<TransactionResult, ApplyError> {
    let payload: AdjustmentPayload = parse_payload(envelope.kind, &envelope.payload)?;
    if payload.product_id.trim().is_empty() {
        return Err(ApplyError::Rejected("Adjustment missing productId".to_string()));
    }

    let Some((previous_level, _)) = read_stock(tx, &payload.product_id)? else {
        return Err(ApplyError::Rejected(format!(
            "Unknown product: {}",
            payload.product_id
        )));
    };

    tx.execute(
        "UPDATE products
         SET stock_level = ?2,
             has_discrepancy = CASE WHEN ?2 >= 0 THEN 0 ELSE 1 END,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![payload.product_id, payload.new_level],
    )?;

    let adjustment_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO stock_adjustments
            (id, transaction_id, product_id, previous_level, new_level, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            adjustment_id,
            envelope.transaction_id,
            payload.product_id,
            previous_level,
            payload.new_level,
            payload.reason,
        ],
    )?;

    Ok(TransactionResult::applied(
        &envelope.transaction_id,
        adjustment_id,
    ))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str, kind: TransactionKind, payload: Value) -> TransactionEnvelope {
        TransactionEnvelope {
            transaction_id: id.to_string(),
            kind,
            timestamp: "2026-03-01T09:00:00Z".to_string(),
            payload,
        }
    }

    fn sale(id: &str, product_id: &str, quantity: i64) -> TransactionEnvelope {
        envelope(
            id,
            TransactionKind::Sale,
            serde_json::json!({
                "items": [{ "productId": product_id, "quantity": quantity, "unitPrice": 3.0 }],
                "totalAmount": 3.0 * quantity as f64
            }),
        )
    }

    #[test]
    fn test_sale_decrements_stock_and_records_sale() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 5);

        let results = apply_batch(&branch, &[sale("txn-1", "p-1", 2)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, TransactionOutcome::Applied);
        assert!(results[0].result_entity_id.is_some());

        let (stock, flagged) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, 3);
        assert!(!flagged);
        assert_eq!(branch.sales_count_for_test(), 1);
    }

    #[test]
    fn test_duplicate_delivery_returns_stored_outcome_without_side_effects() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 5);

        let first = apply_batch(&branch, &[sale("txn-1", "p-1", 2)]);
        let second = apply_batch(&branch, &[sale("txn-1", "p-1", 2)]);

        assert_eq!(first[0].outcome, TransactionOutcome::Applied);
        assert_eq!(second[0].outcome, TransactionOutcome::Applied);
        assert_eq!(first[0].result_entity_id, second[0].result_entity_id);

        // Exactly one decrement and one persisted sale.
        let (stock, _) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, 3);
        assert_eq!(branch.sales_count_for_test(), 1);
    }

    #[test]
    fn test_last_commit_wins_flags_negative_stock_instead_of_rejecting() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 1);

        // Two cashiers each sold the last unit.
        let results = apply_batch(
            &branch,
            &[sale("txn-a", "p-1", 1), sale("txn-b", "p-1", 1)],
        );

        assert_eq!(results[0].outcome, TransactionOutcome::Applied);
        assert_eq!(
            results[1].outcome,
            TransactionOutcome::AppliedWithDiscrepancy
        );
        assert_eq!(results[1].discrepancy_details[0].product_id, "p-1");
        assert_eq!(results[1].discrepancy_details[0].stock_level, -1);

        let (stock, flagged) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, -1);
        assert!(flagged);
        assert_eq!(branch.sales_count_for_test(), 2, "neither sale was rejected");
    }

    #[test]
    fn test_rejection_is_ledgered_and_stable_across_redelivery() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();

        let bad = sale("txn-bad", "ghost-product", 1);
        let first = apply_batch(&branch, &[bad.clone()]);
        assert_eq!(first[0].outcome, TransactionOutcome::PermanentRejection);
        assert_eq!(
            first[0].error_message.as_deref(),
            Some("Unknown product: ghost-product")
        );

        let second = apply_batch(&branch, &[bad]);
        assert_eq!(second[0].outcome, TransactionOutcome::PermanentRejection);
        assert_eq!(branch.sales_count_for_test(), 0);
    }

    #[test]
    fn test_partial_batch_applies_independent_items() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 10);
        branch.seed_product_for_test("p-3", "Coffee", 10);

        let results = apply_batch(
            &branch,
            &[
                sale("txn-1", "p-1", 1),
                envelope(
                    "txn-2",
                    TransactionKind::Sale,
                    serde_json::json!({ "items": [] }),
                ),
                sale("txn-3", "p-3", 1),
            ],
        );

        assert_eq!(results[0].outcome, TransactionOutcome::Applied);
        assert_eq!(results[1].outcome, TransactionOutcome::PermanentRejection);
        assert_eq!(results[2].outcome, TransactionOutcome::Applied);
        assert_eq!(results[1].transaction_id, "txn-2");
        assert_eq!(branch.sales_count_for_test(), 2);
    }

    #[test]
    fn test_failed_sale_rolls_back_partial_stock_mutations() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 10);

        // First line valid, second line unknown: the whole sale must be
        // all-or-nothing, so p-1 keeps its stock.
        let mixed = envelope(
            "txn-mixed",
            TransactionKind::Sale,
            serde_json::json!({
                "items": [
                    { "productId": "p-1", "quantity": 2 },
                    { "productId": "missing", "quantity": 1 }
                ]
            }),
        );
        let results = apply_batch(&branch, &[mixed]);
        assert_eq!(results[0].outcome, TransactionOutcome::PermanentRejection);

        let (stock, _) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, 10);
        assert_eq!(branch.sales_count_for_test(), 0);
    }

    #[test]
    fn test_purchase_restocks_and_clears_discrepancy_flag() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 1);

        apply_batch(&branch, &[sale("txn-a", "p-1", 3)]);
        let (stock, flagged) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, -2);
        assert!(flagged);

        let restock = envelope(
            "txn-restock",
            TransactionKind::Purchase,
            serde_json::json!({
                "items": [{ "productId": "p-1", "quantity": 10 }],
                "supplierName": "Al Noor Trading",
                "totalCost": 40.0
            }),
        );
        let results = apply_batch(&branch, &[restock]);
        assert_eq!(results[0].outcome, TransactionOutcome::Applied);

        let (stock, flagged) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, 8);
        assert!(!flagged, "restock past zero clears the flag");
    }

    #[test]
    fn test_adjustment_sets_absolute_level_and_clears_flag() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();
        branch.seed_product_for_test("p-1", "Tea", 1);
        apply_batch(&branch, &[sale("txn-a", "p-1", 2)]);

        let recount = envelope(
            "txn-count",
            TransactionKind::InventoryAdjustment,
            serde_json::json!({ "productId": "p-1", "newLevel": 4, "reason": "shelf count" }),
        );
        let results = apply_batch(&branch, &[recount]);
        assert_eq!(results[0].outcome, TransactionOutcome::Applied);

        let (stock, flagged) = branch.product_stock_for_test("p-1");
        assert_eq!(stock, 4);
        assert!(!flagged);

        let conn = branch.conn.lock().unwrap();
        let (previous, new_level): (i64, i64) = conn
            .query_row(
                "SELECT previous_level, new_level FROM stock_adjustments
                 WHERE transaction_id = 'txn-count'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(previous, -1);
        assert_eq!(new_level, 4);
    }

    #[test]
    fn test_expense_records_amount_and_rejects_nonpositive() {
        let branch = BranchDb::open_in_memory("b-1").unwrap();

        let ok = envelope(
            "txn-exp",
            TransactionKind::Expense,
            serde_json::json!({ "amount": 120.0, "category": "fuel", "note": "delivery van" }),
        );
        let bad = envelope(
            "txn-exp-bad",
            TransactionKind::Expense,
            serde_json::json!({ "amount": 0.0 }),
        );

        let results = apply_batch(&branch, &[ok, bad]);
        assert_eq!(results[0].outcome, TransactionOutcome::Applied);
        assert_eq!(results[1].outcome, TransactionOutcome::PermanentRejection);

        let conn = branch.conn.lock().unwrap();
        let amount: f64 = conn
            .query_row(
                "SELECT amount FROM expenses WHERE transaction_id = 'txn-exp'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!((amount - 120.0).abs() < f64::EPSILON);
    }
}
