//! Sync dispatcher for the branch terminal.
//!
//! Drains the durable queue against the reconciliation server: batches
//! ready records in FIFO order, submits them sequentially, applies the
//! per-item outcome report, and schedules retries with a fixed backoff
//! schedule. At most one sync pass is in flight at a time; triggers that
//! arrive mid-pass set a rerun flag instead of running concurrently.
//!
//! Triggers: the connectivity monitor's Offline->Online event, a periodic
//! timer while online, and a nudge after each new enqueue while online.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, SharedAlertSink};
use crate::api::BatchTransport;
use crate::connectivity::ConnState;
use crate::db::{self, DbState};
use crate::protocol::{
    SyncBatchRequest, TransactionEnvelope, TransactionOutcome, TransactionResult,
};
use crate::queue::{self, QueueRecord};

const MAX_RETRY_DELAY_MS: i64 = 300_000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the dispatcher and its background tasks.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum transactions per wire batch.
    pub batch_size: usize,
    /// Maximum ready records fetched per drain iteration.
    pub pass_limit: i64,
    /// Delivery attempts before a record fails terminally.
    pub max_attempts: i64,
    /// Fixed retry delays; the last entry caps all later attempts.
    pub backoff_schedule: Vec<Duration>,
    /// Periodic pass interval while online.
    pub sync_interval: Duration,
    /// Active health-check interval while offline.
    pub health_check_interval: Duration,
    /// Completed-record retention before pruning.
    pub retention_days: i64,
    /// Pending backlog size that raises an operator alert.
    pub backlog_alert_threshold: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            pass_limit: 100,
            max_attempts: 3,
            backoff_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
            sync_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            retention_days: 7,
            backlog_alert_threshold: 500,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `failure_count` (1-based). Past the end of
    /// the schedule the last entry applies.
    fn backoff_delay(&self, failure_count: i64) -> Duration {
        let Some(last) = self.backoff_schedule.last() else {
            return Duration::from_secs(1);
        };
        let idx = (failure_count.max(1) as usize - 1).min(self.backoff_schedule.len() - 1);
        *self.backoff_schedule.get(idx).unwrap_or(last)
    }
}

/// Identity attached to every batch submission.
#[derive(Debug, Clone)]
pub struct TerminalIdentity {
    pub terminal_id: String,
    pub branch_id: String,
}

impl TerminalIdentity {
    /// Build from the credentials stored during provisioning.
    pub fn from_stored_credentials() -> Result<Self, String> {
        let branch_id =
            crate::storage::get_credential("branch_id").ok_or("Branch ID not configured")?;
        let terminal_id = crate::storage::get_credential("terminal_id").unwrap_or_default();
        Ok(Self {
            terminal_id,
            branch_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry scheduling
// ---------------------------------------------------------------------------

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn jitter_seed(record_id: &str) -> i64 {
    record_id.bytes().map(i64::from).sum()
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter)).to_rfc3339()
}

// ---------------------------------------------------------------------------
// Dispatcher state and status snapshot
// ---------------------------------------------------------------------------

/// Shared dispatcher state: single-flight guard, rerun flag, last
/// successful pass timestamp, and the enqueue nudge.
pub struct SyncState {
    is_syncing: AtomicBool,
    rerun: AtomicBool,
    last_sync: Mutex<Option<String>>,
    nudge: Notify,
}

impl SyncState {
    fn new() -> Self {
        Self {
            is_syncing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            nudge: Notify::new(),
        }
    }
}

/// Steady-state signal for the UI: pending count, last pass time, and
/// whether a pass is currently running.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: i64,
    pub last_sync_at: Option<String>,
    pub sync_in_progress: bool,
    pub is_online: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The sync dispatcher. Owns the queue drain algorithm; the only writer of
/// queue status after enqueue.
pub struct SyncEngine<T: BatchTransport> {
    db: Arc<DbState>,
    transport: Arc<T>,
    config: SyncConfig,
    identity: TerminalIdentity,
    state: SyncState,
    alerts: SharedAlertSink,
    events: broadcast::Sender<SyncStatus>,
    online_rx: watch::Receiver<ConnState>,
}

impl<T: BatchTransport> SyncEngine<T> {
    /// Create the engine and heal any records a previous process left
    /// in-flight. Call once at startup, before `start`.
    pub fn new(
        db: Arc<DbState>,
        transport: Arc<T>,
        identity: TerminalIdentity,
        config: SyncConfig,
        alerts: SharedAlertSink,
        online_rx: watch::Receiver<ConnState>,
    ) -> Result<(Arc<Self>, broadcast::Receiver<SyncStatus>), String> {
        queue::reset_stuck_syncing(&db)?;

        let (events, events_rx) = broadcast::channel(16);
        let engine = Arc::new(Self {
            db,
            transport,
            config,
            identity,
            state: SyncState::new(),
            alerts,
            events,
            online_rx,
        });
        Ok((engine, events_rx))
    }

    /// Subscribe to status snapshots published after every pass.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.events.subscribe()
    }

    /// Enqueue a domain action and nudge the dispatcher. The queue write is
    /// the durability guarantee: an `Err` here means the action must not be
    /// reported as complete to the cashier.
    pub fn enqueue(
        &self,
        kind: crate::protocol::TransactionKind,
        payload: &serde_json::Value,
    ) -> Result<QueueRecord, String> {
        let record = queue::enqueue(&self.db, kind, payload)?;
        self.state.nudge.notify_one();
        Ok(record)
    }

    /// Current status snapshot for the UI.
    pub fn status(&self) -> Result<SyncStatus, String> {
        let pending_count = queue::pending_count(&self.db)?;
        let last_sync_at = self
            .state
            .last_sync
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .or_else(|| {
                let conn = self.db.conn.lock().ok()?;
                db::get_setting(&conn, "sync", "last_sync_at")
            });
        Ok(SyncStatus {
            pending_count,
            last_sync_at,
            sync_in_progress: self.state.is_syncing.load(Ordering::SeqCst),
            is_online: self.online_rx.borrow().is_online(),
        })
    }

    // -----------------------------------------------------------------------
    // Sync pass
    // -----------------------------------------------------------------------

    /// Run one sync pass. If a pass is already in flight the call returns
    /// immediately and the running pass re-drains before finishing.
    pub async fn run_sync_pass(&self) -> Result<usize, String> {
        if self
            .state
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.state.rerun.store(true, Ordering::SeqCst);
            debug!("Sync pass already running; rerun requested");
            return Ok(0);
        }

        let result = self.run_locked_pass().await;
        self.state.is_syncing.store(false, Ordering::SeqCst);
        self.publish_status();
        result
    }

    async fn run_locked_pass(&self) -> Result<usize, String> {
        let mut total = 0usize;
        loop {
            total += self.drain_queue().await?;
            if !self.state.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            debug!("Trigger arrived mid-pass; draining again");
        }

        let now = Utc::now().to_rfc3339();
        if let Ok(mut guard) = self.state.last_sync.lock() {
            *guard = Some(now.clone());
        }
        if let Ok(conn) = self.db.conn.lock() {
            let _ = db::set_setting(&conn, "sync", "last_sync_at", &now);
        }
        Ok(total)
    }

    /// Drain ready records until none remain or the server becomes
    /// unreachable. Batches are submitted strictly sequentially: batch N+1
    /// never starts before batch N's outcomes are recorded, because later
    /// transactions may depend on inventory effects of earlier ones.
    async fn drain_queue(&self) -> Result<usize, String> {
        let mut completed = 0usize;
        'drain: loop {
            let ready = queue::list_ready(&self.db, self.config.pass_limit)?;
            if ready.is_empty() {
                break;
            }

            for chunk in ready.chunks(self.config.batch_size) {
                let ids: Vec<String> = chunk.iter().map(|r| r.id.clone()).collect();
                queue::mark_syncing(&self.db, &ids)?;

                let request = self.build_request(chunk);
                match self.transport.submit_batch(request).await {
                    Ok(response) => {
                        completed += self.record_batch_outcomes(chunk, &response.results)?;
                    }
                    Err(e) => {
                        // No per-item outcomes exist: every item of this
                        // batch is a transient failure, and the rest of the
                        // pass is pointless against an unreachable server.
                        warn!(error = %e, batch = chunk.len(), "Batch submission failed");
                        for record in chunk {
                            self.record_transient_failure(record, &e)?;
                        }
                        break 'drain;
                    }
                }
            }
        }
        Ok(completed)
    }

    fn build_request(&self, chunk: &[QueueRecord]) -> SyncBatchRequest {
        SyncBatchRequest {
            terminal_id: self.identity.terminal_id.clone(),
            branch_id: self.identity.branch_id.clone(),
            transactions: chunk
                .iter()
                .map(|r| TransactionEnvelope {
                    transaction_id: r.id.clone(),
                    kind: r.kind,
                    timestamp: r.created_at.clone(),
                    payload: r.payload.clone(),
                })
                .collect(),
        }
    }

    /// Apply the server's per-item outcome report. One item's failure never
    /// aborts processing of the others.
    fn record_batch_outcomes(
        &self,
        chunk: &[QueueRecord],
        results: &[TransactionResult],
    ) -> Result<usize, String> {
        let by_id: HashMap<&str, &TransactionResult> = results
            .iter()
            .map(|r| (r.transaction_id.as_str(), r))
            .collect();

        let mut completed = 0usize;
        for record in chunk {
            match by_id.get(record.id.as_str()) {
                Some(result) => {
                    if self.record_item_outcome(record, result)? {
                        completed += 1;
                    }
                }
                None => {
                    // The server's report should match the input; a missing
                    // entry is indistinguishable from a lost response.
                    self.record_transient_failure(
                        record,
                        "Missing outcome in sync batch response",
                    )?;
                }
            }
        }
        Ok(completed)
    }

    fn record_item_outcome(
        &self,
        record: &QueueRecord,
        result: &TransactionResult,
    ) -> Result<bool, String> {
        match result.outcome {
            TransactionOutcome::Applied => {
                queue::mark_completed(&self.db, &record.id)?;
                Ok(true)
            }
            TransactionOutcome::AppliedWithDiscrepancy => {
                // The sale itself succeeded; the conflict flag must reach a
                // human without blocking the queue.
                queue::mark_completed(&self.db, &record.id)?;
                self.alerts.notify(Alert::Discrepancy {
                    transaction_id: record.id.clone(),
                    details: result.discrepancy_details.clone(),
                });
                Ok(true)
            }
            TransactionOutcome::PermanentRejection => {
                let error = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Rejected by sync server".to_string());
                queue::mark_failed_terminal(&self.db, &record.id, &error)?;
                self.alerts.notify(Alert::TerminalFailure {
                    transaction_id: record.id.clone(),
                    error,
                });
                Ok(false)
            }
            TransactionOutcome::TransientFailure => {
                let error = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Transient sync server failure".to_string());
                self.record_transient_failure(record, &error)?;
                Ok(false)
            }
        }
    }

    fn record_transient_failure(&self, record: &QueueRecord, error: &str) -> Result<(), String> {
        let failure_count = record.attempts + 1;
        if failure_count >= self.config.max_attempts {
            queue::mark_failed_terminal(&self.db, &record.id, error)?;
            self.alerts.notify(Alert::TerminalFailure {
                transaction_id: record.id.clone(),
                error: error.to_string(),
            });
        } else {
            let delay = self.config.backoff_delay(failure_count);
            let next_retry_at =
                schedule_next_retry(delay.as_millis() as i64, jitter_seed(&record.id));
            queue::mark_failed_retry(&self.db, &record.id, error, &next_retry_at)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background task
    // -----------------------------------------------------------------------

    fn run_maintenance(&self) {
        if let Err(e) = queue::prune_completed(&self.db, self.config.retention_days) {
            warn!("Queue pruning failed: {e}");
        }
        match queue::pending_count(&self.db) {
            Ok(pending) if pending >= self.config.backlog_alert_threshold => {
                self.alerts.notify(Alert::PendingBacklog { pending });
            }
            _ => {}
        }
    }

    fn publish_status(&self) {
        if let Ok(status) = self.status() {
            let _ = self.events.send(status);
        }
    }

    /// Spawn the dispatcher loop. Passes run only while the monitor reports
    /// Online; the Offline->Online transition triggers an immediate pass
    /// instead of waiting out the timer.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut online_rx = self.online_rx.clone();
            let mut interval = tokio::time::interval(self.config.sync_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.sync_interval.as_secs(),
                "Sync dispatcher started"
            );

            loop {
                let should_sync = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Sync dispatcher stopped");
                        break;
                    }
                    _ = interval.tick() => online_rx.borrow().is_online(),
                    changed = online_rx.changed() => {
                        match changed {
                            Ok(()) => {
                                let online = online_rx.borrow_and_update().is_online();
                                if online {
                                    info!("Connectivity restored; starting immediate sync pass");
                                }
                                online
                            }
                            Err(_) => break,
                        }
                    }
                    _ = self.state.nudge.notified() => online_rx.borrow().is_online(),
                };

                if !should_sync {
                    continue;
                }

                self.run_maintenance();
                match self.run_sync_pass().await {
                    Ok(completed) if completed > 0 => {
                        info!(completed, "Sync pass complete");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Sync pass failed: {e}"),
                }
            }
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::db;
    use crate::protocol::{SyncBatchResponse, TransactionKind};
    use crate::server::reconcile;
    use crate::server::store::BranchDb;
    use chrono::DateTime;
    use rusqlite::{params, Connection};
    use std::collections::VecDeque;

    fn test_db() -> Arc<DbState> {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        })
    }

    // -- Test doubles -------------------------------------------------------

    /// Scripted per-batch behavior for the transport double.
    #[derive(Debug, Clone)]
    enum ScriptStep {
        AllApplied,
        PerItem(Vec<TransactionOutcome>),
        TransportError(String),
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<ScriptStep>>,
        requests: Mutex<Vec<SyncBatchRequest>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn submitted(&self) -> Vec<SyncBatchRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn respond(step: &ScriptStep, request: &SyncBatchRequest) -> Result<SyncBatchResponse, String> {
            match step {
                ScriptStep::TransportError(e) => Err(e.clone()),
                ScriptStep::AllApplied => Ok(SyncBatchResponse {
                    results: request
                        .transactions
                        .iter()
                        .map(|t| TransactionResult::applied(&t.transaction_id, "entity-1".into()))
                        .collect(),
                }),
                ScriptStep::PerItem(outcomes) => Ok(SyncBatchResponse {
                    results: request
                        .transactions
                        .iter()
                        .zip(outcomes.iter())
                        .map(|(t, outcome)| match outcome {
                            TransactionOutcome::Applied => {
                                TransactionResult::applied(&t.transaction_id, "entity-1".into())
                            }
                            TransactionOutcome::AppliedWithDiscrepancy => TransactionResult {
                                transaction_id: t.transaction_id.clone(),
                                outcome: TransactionOutcome::AppliedWithDiscrepancy,
                                result_entity_id: Some("entity-1".into()),
                                discrepancy_details: vec![crate::protocol::DiscrepancyDetail {
                                    product_id: "p-1".into(),
                                    stock_level: -1,
                                }],
                                error_message: None,
                            },
                            TransactionOutcome::PermanentRejection => TransactionResult::rejected(
                                &t.transaction_id,
                                "Invalid line item".into(),
                            ),
                            TransactionOutcome::TransientFailure => TransactionResult::transient(
                                &t.transaction_id,
                                "Sync server error (HTTP 503)".into(),
                            ),
                        })
                        .collect(),
                }),
            }
        }
    }

    impl BatchTransport for ScriptedTransport {
        async fn submit_batch(
            &self,
            request: SyncBatchRequest,
        ) -> Result<SyncBatchResponse, String> {
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ScriptStep::AllApplied);
            let response = Self::respond(&step, &request);
            self.requests.lock().unwrap().push(request);
            response
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    /// Transport that applies batches directly against an in-process branch
    /// database, exercising the full client + server reconciliation path.
    struct InProcessTransport {
        branch: Arc<BranchDb>,
    }

    impl BatchTransport for InProcessTransport {
        async fn submit_batch(
            &self,
            request: SyncBatchRequest,
        ) -> Result<SyncBatchResponse, String> {
            Ok(SyncBatchResponse {
                results: reconcile::apply_batch(&self.branch, &request.transactions),
            })
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CollectingAlertSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl AlertSink for CollectingAlertSink {
        fn notify(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    impl CollectingAlertSink {
        fn collected(&self) -> Vec<Alert> {
            self.alerts.lock().unwrap().clone()
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn online_rx() -> watch::Receiver<ConnState> {
        let (tx, rx) = watch::channel(ConnState::Online);
        // Keep the sender alive for the duration of the test process.
        std::mem::forget(tx);
        rx
    }

    fn identity() -> TerminalIdentity {
        TerminalIdentity {
            terminal_id: "term-1".into(),
            branch_id: "branch-1".into(),
        }
    }

    fn engine_with<T: BatchTransport>(
        db: Arc<DbState>,
        transport: Arc<T>,
        config: SyncConfig,
        alerts: Arc<CollectingAlertSink>,
    ) -> Arc<SyncEngine<T>> {
        let sink: SharedAlertSink = alerts;
        let (engine, _events) =
            SyncEngine::new(db, transport, identity(), config, sink, online_rx())
                .expect("engine");
        engine
    }

    fn sale_payload(product_id: &str, quantity: i64) -> serde_json::Value {
        serde_json::json!({
            "items": [{ "productId": product_id, "quantity": quantity, "unitPrice": 4.0 }],
            "totalAmount": 4.0 * quantity as f64
        })
    }

    fn backdate(db: &DbState, id: &str, created_at: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_queue SET created_at = ?2 WHERE id = ?1",
            params![id, created_at],
        )
        .unwrap();
    }

    fn make_ready_now(db: &DbState, id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_queue SET next_retry_at = datetime('now', '-1 seconds') WHERE id = ?1",
            params![id],
        )
        .unwrap();
    }

    fn retry_delay_ms(record: &QueueRecord) -> i64 {
        let next = DateTime::parse_from_rfc3339(record.next_retry_at.as_deref().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        (next - Utc::now()).num_milliseconds()
    }

    // -- Dispatcher behavior ------------------------------------------------

    #[tokio::test]
    async fn test_pass_completes_applied_items_and_updates_status() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![ScriptStep::AllApplied]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(db.clone(), transport.clone(), SyncConfig::default(), alerts);

        engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 1))
            .unwrap();
        engine
            .enqueue(TransactionKind::Expense, &serde_json::json!({ "amount": 12.0 }))
            .unwrap();

        let completed = engine.run_sync_pass().await.unwrap();
        assert_eq!(completed, 2);

        let status = engine.status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync_at.is_some());
        assert!(!status.sync_in_progress);

        let submitted = transport.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].branch_id, "branch-1");
        assert_eq!(submitted[0].transactions.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_order_preserved_across_batches() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let config = SyncConfig {
            batch_size: 1,
            ..SyncConfig::default()
        };
        let engine = engine_with(db.clone(), transport.clone(), config, alerts);

        let first = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 3))
            .unwrap();
        let second = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 4))
            .unwrap();
        backdate(&db, &first.id, "2026-03-01T09:00:00+00:00");
        backdate(&db, &second.id, "2026-03-01T09:00:05+00:00");

        engine.run_sync_pass().await.unwrap();

        let submitted = transport.submitted();
        assert_eq!(submitted.len(), 2, "one batch per record at batch_size 1");
        assert_eq!(submitted[0].transactions[0].transaction_id, first.id);
        assert_eq!(submitted[1].transactions[0].transaction_id, second.id);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_with_schedule_then_fail_terminal() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![
            ScriptStep::TransportError("Cannot reach sync server at https://x".into()),
            ScriptStep::TransportError("Cannot reach sync server at https://x".into()),
            ScriptStep::TransportError("Cannot reach sync server at https://x".into()),
        ]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(
            db.clone(),
            transport.clone(),
            SyncConfig::default(),
            alerts.clone(),
        );

        let record = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 1))
            .unwrap();

        // First failure: 1s backoff (plus bounded jitter).
        engine.run_sync_pass().await.unwrap();
        let stored = queue::get_record(&db, &record.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, queue::QueueStatus::Pending);
        let delay = retry_delay_ms(&stored);
        assert!((900..2_000).contains(&delay), "delay was {delay}ms");

        // Second failure: 5s backoff.
        make_ready_now(&db, &record.id);
        engine.run_sync_pass().await.unwrap();
        let stored = queue::get_record(&db, &record.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        let delay = retry_delay_ms(&stored);
        assert!((4_900..6_000).contains(&delay), "delay was {delay}ms");

        // Third failure exhausts max_attempts: terminal, surfaced, never
        // picked up again.
        make_ready_now(&db, &record.id);
        engine.run_sync_pass().await.unwrap();
        let stored = queue::get_record(&db, &record.id).unwrap().unwrap();
        assert_eq!(stored.status, queue::QueueStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(matches!(
            alerts.collected().last(),
            Some(Alert::TerminalFailure { .. })
        ));

        let before = transport.submitted().len();
        engine.run_sync_pass().await.unwrap();
        assert_eq!(transport.submitted().len(), before, "no further deliveries");
    }

    #[tokio::test]
    async fn test_backoff_schedule_caps_at_last_entry() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![
            ScriptStep::TransportError("timed out".into()),
            ScriptStep::TransportError("timed out".into()),
            ScriptStep::TransportError("timed out".into()),
        ]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let config = SyncConfig {
            max_attempts: 5,
            ..SyncConfig::default()
        };
        let engine = engine_with(db.clone(), transport, config, alerts);

        let record = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 1))
            .unwrap();

        for _ in 0..3 {
            make_ready_now(&db, &record.id);
            engine.run_sync_pass().await.unwrap();
        }
        let stored = queue::get_record(&db, &record.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        // Third failure lands on the 15s cap.
        let delay = retry_delay_ms(&stored);
        assert!((14_900..16_000).contains(&delay), "delay was {delay}ms");
    }

    #[tokio::test]
    async fn test_partial_batch_success_is_reported_per_item() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![ScriptStep::PerItem(vec![
            TransactionOutcome::Applied,
            TransactionOutcome::PermanentRejection,
            TransactionOutcome::Applied,
        ])]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(
            db.clone(),
            transport,
            SyncConfig::default(),
            alerts.clone(),
        );

        let a = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 1))
            .unwrap();
        let b = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-2", 1))
            .unwrap();
        let c = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-3", 1))
            .unwrap();

        let completed = engine.run_sync_pass().await.unwrap();
        assert_eq!(completed, 2);

        assert_eq!(
            queue::get_record(&db, &a.id).unwrap().unwrap().status,
            queue::QueueStatus::Completed
        );
        let rejected = queue::get_record(&db, &b.id).unwrap().unwrap();
        assert_eq!(rejected.status, queue::QueueStatus::Failed);
        assert_eq!(rejected.last_error.as_deref(), Some("Invalid line item"));
        assert_eq!(
            queue::get_record(&db, &c.id).unwrap().unwrap().status,
            queue::QueueStatus::Completed
        );

        let collected = alerts.collected();
        assert_eq!(collected.len(), 1);
        assert!(matches!(
            &collected[0],
            Alert::TerminalFailure { transaction_id, .. } if *transaction_id == b.id
        ));
    }

    #[tokio::test]
    async fn test_discrepancy_outcome_completes_and_raises_alert() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![ScriptStep::PerItem(vec![
            TransactionOutcome::AppliedWithDiscrepancy,
        ])]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(
            db.clone(),
            transport,
            SyncConfig::default(),
            alerts.clone(),
        );

        let record = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-1", 2))
            .unwrap();
        let completed = engine.run_sync_pass().await.unwrap();
        assert_eq!(completed, 1);
        assert_eq!(
            queue::get_record(&db, &record.id).unwrap().unwrap().status,
            queue::QueueStatus::Completed
        );

        let collected = alerts.collected();
        assert!(matches!(
            &collected[0],
            Alert::Discrepancy { transaction_id, details }
                if *transaction_id == record.id && details[0].stock_level == -1
        ));
    }

    #[tokio::test]
    async fn test_concurrent_trigger_sets_rerun_instead_of_second_pass() {
        let db = test_db();
        let transport = ScriptedTransport::new(vec![]);
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(db, transport, SyncConfig::default(), alerts);

        engine.state.is_syncing.store(true, Ordering::SeqCst);
        let completed = engine.run_sync_pass().await.unwrap();
        assert_eq!(completed, 0);
        assert!(engine.state.rerun.load(Ordering::SeqCst));
        engine.state.is_syncing.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_startup_resets_syncing_rows_left_by_crash() {
        let db = test_db();
        let stuck = queue::enqueue(&db, TransactionKind::Sale, &sale_payload("p-1", 1)).unwrap();
        queue::mark_syncing(&db, &[stuck.id.clone()]).unwrap();

        let transport = ScriptedTransport::new(vec![ScriptStep::AllApplied]);
        let alerts = Arc::new(CollectingAlertSink::default());
        // Engine construction performs the crash recovery.
        let engine = engine_with(db.clone(), transport, SyncConfig::default(), alerts);

        assert_eq!(
            queue::get_record(&db, &stuck.id).unwrap().unwrap().status,
            queue::QueueStatus::Pending
        );
        let completed = engine.run_sync_pass().await.unwrap();
        assert_eq!(completed, 1);
    }

    // -- End-to-end against the reconciliation service ----------------------

    #[tokio::test]
    async fn test_offline_sales_reconcile_with_last_commit_wins() {
        let db = test_db();
        let branch = Arc::new(BranchDb::open_in_memory("branch-1").unwrap());
        branch.seed_product_for_test("p-10", "Beans 1kg", 5);

        let transport = Arc::new(InProcessTransport {
            branch: branch.clone(),
        });
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(
            db.clone(),
            transport,
            SyncConfig::default(),
            alerts.clone(),
        );

        // Offline: cashier sells 3 units, then 4 units of the same product.
        let sale_a = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-10", 3))
            .unwrap();
        let sale_b = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-10", 4))
            .unwrap();
        backdate(&db, &sale_a.id, "2026-03-01T09:00:00+00:00");
        backdate(&db, &sale_b.id, "2026-03-01T09:04:00+00:00");

        // Reconnect.
        let completed = engine.run_sync_pass().await.unwrap();
        assert_eq!(completed, 2);

        // Both sales recorded; stock went 5 -> 2 -> -2 and was flagged.
        let (stock, flagged) = branch.product_stock_for_test("p-10");
        assert_eq!(stock, -2);
        assert!(flagged);
        assert_eq!(branch.sales_count_for_test(), 2);

        for id in [&sale_a.id, &sale_b.id] {
            assert_eq!(
                queue::get_record(&db, id).unwrap().unwrap().status,
                queue::QueueStatus::Completed
            );
        }
        let status = engine.status().unwrap();
        assert_eq!(status.pending_count, 0);

        // Only the second sale crossed zero.
        let collected = alerts.collected();
        assert_eq!(collected.len(), 1);
        assert!(matches!(
            &collected[0],
            Alert::Discrepancy { transaction_id, details }
                if *transaction_id == sale_b.id
                    && details[0].product_id == "p-10"
                    && details[0].stock_level == -2
        ));
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_not_double_applied() {
        let db = test_db();
        let branch = Arc::new(BranchDb::open_in_memory("branch-1").unwrap());
        branch.seed_product_for_test("p-20", "Olive oil", 10);

        let transport = Arc::new(InProcessTransport {
            branch: branch.clone(),
        });
        let alerts = Arc::new(CollectingAlertSink::default());
        let engine = engine_with(db.clone(), transport, SyncConfig::default(), alerts);

        let record = engine
            .enqueue(TransactionKind::Sale, &sale_payload("p-20", 4))
            .unwrap();
        engine.run_sync_pass().await.unwrap();

        // Simulate a lost acknowledgment: the completed record is forced
        // back to pending and delivered again.
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE sync_queue SET status = 'pending', completed_at = NULL WHERE id = ?1",
                params![record.id],
            )
            .unwrap();
        }
        engine.run_sync_pass().await.unwrap();

        let (stock, flagged) = branch.product_stock_for_test("p-20");
        assert_eq!(stock, 6, "exactly one decrement despite redelivery");
        assert!(!flagged);
        assert_eq!(branch.sales_count_for_test(), 1);
    }
}
