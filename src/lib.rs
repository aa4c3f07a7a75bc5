//! branch-sync: offline transaction queue and reconciliation engine for a
//! multi-branch POS.
//!
//! The client side (embedded by the terminal host application) is the
//! durable queue ([`queue`]), the connectivity monitor ([`connectivity`]),
//! and the sync dispatcher ([`sync`]) speaking the batch protocol
//! ([`protocol`]) over HTTP ([`api`]). The server side ([`server`]) applies
//! those batches against per-branch databases with last-commit-wins
//! inventory reconciliation and an idempotency ledger, so at-least-once
//! delivery never double-applies a sale.

pub mod alerts;
pub mod api;
pub mod connectivity;
pub mod db;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alerts::SharedAlertSink;
use crate::api::BatchTransport;
use crate::connectivity::ConnectivityMonitor;
use crate::sync::{SyncConfig, SyncEngine, SyncStatus, TerminalIdentity};

/// Running client engine: the dispatcher and connectivity monitor plus the
/// cancellation token that stops both.
///
/// Owns an explicit lifecycle: built once at host startup (which also heals
/// queue records left in-flight by a crash) and shut down at exit. An
/// in-flight batch either finishes during shutdown or is reset to pending
/// on the next start.
pub struct EngineRuntime<T: BatchTransport> {
    pub engine: Arc<SyncEngine<T>>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub events: tokio::sync::broadcast::Receiver<SyncStatus>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Wire up and start the client engine against the given transport.
pub fn start_engine<T: BatchTransport>(
    db: Arc<db::DbState>,
    transport: Arc<T>,
    identity: TerminalIdentity,
    config: SyncConfig,
    alerts: SharedAlertSink,
) -> Result<EngineRuntime<T>, String> {
    let (monitor, online_rx) = ConnectivityMonitor::new();
    let (engine, events) = SyncEngine::new(
        db,
        Arc::clone(&transport),
        identity,
        config.clone(),
        alerts,
        online_rx,
    )?;

    let cancel = CancellationToken::new();
    let monitor_task = monitor.start(
        transport,
        config.health_check_interval,
        cancel.child_token(),
    );
    let engine_task = Arc::clone(&engine).start(cancel.child_token());

    Ok(EngineRuntime {
        engine,
        monitor,
        events,
        cancel,
        tasks: vec![monitor_task, engine_task],
    })
}

impl<T: BatchTransport> EngineRuntime<T> {
    /// Stop the background tasks and wait for them to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
