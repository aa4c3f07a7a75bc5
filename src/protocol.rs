//! Wire types for the batch sync protocol.
//!
//! The client submits a `SyncBatchRequest` to `POST /sync/batch` and gets a
//! `SyncBatchResponse` whose `results` array matches the input order. Batches
//! are acknowledged atomically at the transport level but each transaction is
//! applied independently on the server, so partial success is normal and is
//! reported per item.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain type of a queued transaction. Dispatched by the server to the
/// matching domain handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Sale,
    Purchase,
    Expense,
    InventoryAdjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Sale => "sale",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Expense => "expense",
            TransactionKind::InventoryAdjustment => "inventory_adjustment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sale" => Some(TransactionKind::Sale),
            "purchase" => Some(TransactionKind::Purchase),
            "expense" => Some(TransactionKind::Expense),
            "inventory_adjustment" => Some(TransactionKind::InventoryAdjustment),
            _ => None,
        }
    }
}

/// One transaction inside a batch. `transaction_id` is the client-generated
/// queue record id and doubles as the idempotency key on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEnvelope {
    pub transaction_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Client-local creation time. Used only for chronological ordering on
    /// the client; the server never trusts it as authoritative sale time.
    pub timestamp: String,
    pub payload: Value,
}

/// Request body for `POST /sync/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatchRequest {
    pub terminal_id: String,
    pub branch_id: String,
    pub transactions: Vec<TransactionEnvelope>,
}

/// Per-transaction outcome reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionOutcome {
    /// Applied cleanly.
    Applied,
    /// Applied, but reconciliation flagged an inventory conflict (for
    /// example a decrement drove stock negative). The transaction itself
    /// succeeded; the flag must reach a human.
    AppliedWithDiscrepancy,
    /// The payload can never apply (validation failure). Not retried.
    PermanentRejection,
    /// The server could not apply the transaction right now (storage
    /// error, shutdown in progress). Safe to retry.
    TransientFailure,
}

impl TransactionOutcome {
    /// Terminal outcomes are recorded in the idempotency ledger; transient
    /// ones are not, so a retry re-executes.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionOutcome::TransientFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionOutcome::Applied => "applied",
            TransactionOutcome::AppliedWithDiscrepancy => "appliedWithDiscrepancy",
            TransactionOutcome::PermanentRejection => "permanentRejection",
            TransactionOutcome::TransientFailure => "transientFailure",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "applied" => Some(TransactionOutcome::Applied),
            "appliedWithDiscrepancy" => Some(TransactionOutcome::AppliedWithDiscrepancy),
            "permanentRejection" => Some(TransactionOutcome::PermanentRejection),
            "transientFailure" => Some(TransactionOutcome::TransientFailure),
            _ => None,
        }
    }
}

/// A flagged inventory conflict attached to an `appliedWithDiscrepancy`
/// outcome: which product, and the stock level after the decrement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyDetail {
    pub product_id: String,
    pub stock_level: i64,
}

/// Per-transaction result in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub transaction_id: String,
    pub outcome: TransactionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrepancy_details: Vec<DiscrepancyDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransactionResult {
    pub fn applied(transaction_id: &str, entity_id: String) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            outcome: TransactionOutcome::Applied,
            result_entity_id: Some(entity_id),
            discrepancy_details: Vec::new(),
            error_message: None,
        }
    }

    pub fn rejected(transaction_id: &str, error: String) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            outcome: TransactionOutcome::PermanentRejection,
            result_entity_id: None,
            discrepancy_details: Vec::new(),
            error_message: Some(error),
        }
    }

    pub fn transient(transaction_id: &str, error: String) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            outcome: TransactionOutcome::TransientFailure,
            result_entity_id: None,
            discrepancy_details: Vec::new(),
            error_message: Some(error),
        }
    }
}

/// Response body for `POST /sync/batch`. `results[i]` corresponds to
/// `transactions[i]` of the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatchResponse {
    pub results: Vec<TransactionResult>,
}
