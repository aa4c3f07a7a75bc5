//! Alerting seam between the sync engine and the host application.
//!
//! The engine never blocks the cashier's workflow on a conflict; it emits a
//! signal and moves on. The host decides how the signal reaches a human
//! (dashboard badge, push notification). The default sink logs through
//! `tracing` so signals are never silently dropped when no sink is wired.

use std::sync::Arc;
use tracing::warn;

use crate::protocol::DiscrepancyDetail;

/// A business-significant signal that must reach an operator.
#[derive(Debug, Clone)]
pub enum Alert {
    /// The server applied a transaction but flagged an inventory conflict
    /// (stock driven negative by a concurrent or offline sale).
    Discrepancy {
        transaction_id: String,
        details: Vec<DiscrepancyDetail>,
    },
    /// A queue record exhausted its retries or was permanently rejected.
    /// It will never apply automatically.
    TerminalFailure {
        transaction_id: String,
        error: String,
    },
    /// The pending backlog crossed the configured threshold; the terminal
    /// has likely been offline for a long stretch.
    PendingBacklog { pending: i64 },
}

/// Delivery contract for alerts. Implementations must be cheap and
/// non-blocking; the dispatcher calls this inline between batches.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Default sink: structured log records at warn level.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: Alert) {
        match alert {
            Alert::Discrepancy {
                transaction_id,
                details,
            } => {
                for detail in &details {
                    warn!(
                        transaction_id = %transaction_id,
                        product_id = %detail.product_id,
                        stock_level = detail.stock_level,
                        "Inventory discrepancy flagged during sync"
                    );
                }
            }
            Alert::TerminalFailure {
                transaction_id,
                error,
            } => {
                warn!(
                    transaction_id = %transaction_id,
                    error,
                    "Sync item failed terminally; operator review required"
                );
            }
            Alert::PendingBacklog { pending } => {
                warn!(pending, "Sync backlog above threshold");
            }
        }
    }
}

/// Shared sink handle used across the engine's background tasks.
pub type SharedAlertSink = Arc<dyn AlertSink>;
