//! Connectivity monitor for the branch terminal.
//!
//! Two-state machine (Online / Offline) with asymmetric confirmation: a
//! passive network-interface offline signal flips to Offline immediately,
//! but Online is only committed after an active health check against the
//! server succeeds. Fast to declare offline, slow to declare online, so the
//! dispatcher never flaps into sync attempts against a server that is not
//! actually reachable.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::BatchTransport;

/// Confirmed connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Online,
    Offline,
}

impl ConnState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnState::Online)
    }
}

// ---------------------------------------------------------------------------
// Core state machine
// ---------------------------------------------------------------------------

/// The pure transition logic, separated from timers and I/O so hysteresis
/// behavior is testable synchronously.
#[derive(Debug)]
pub struct MonitorCore {
    confirmed: ConnState,
    passive_online: bool,
}

impl MonitorCore {
    /// Starts Offline: reachability must be proven by a health check before
    /// the first sync pass, even if the network interface looks up.
    pub fn new() -> Self {
        Self {
            confirmed: ConnState::Offline,
            passive_online: true,
        }
    }

    pub fn confirmed(&self) -> ConnState {
        self.confirmed
    }

    /// Network-interface-level signal. Offline commits immediately; online
    /// only makes Online a candidate pending health-check confirmation.
    pub fn on_passive_signal(&mut self, online: bool) -> Option<ConnState> {
        self.passive_online = online;
        if !online && self.confirmed == ConnState::Online {
            self.confirmed = ConnState::Offline;
            return Some(ConnState::Offline);
        }
        None
    }

    /// Result of an active health check. Only drives the machine while
    /// Offline; a failed check against a confirmed Online state is ignored
    /// (checks are suppressed there anyway, and a single miss must not
    /// flip the state without the passive signal).
    pub fn on_health_check(&mut self, reachable: bool) -> Option<ConnState> {
        if self.confirmed == ConnState::Online {
            return None;
        }
        if reachable && self.passive_online {
            self.confirmed = ConnState::Online;
            return Some(ConnState::Online);
        }
        None
    }

    /// Active checks run only while Offline.
    pub fn wants_health_check(&self) -> bool {
        self.confirmed == ConnState::Offline
    }
}

impl Default for MonitorCore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// Owns the state machine, publishes confirmed transitions on a watch
/// channel, and runs the periodic health-check task.
pub struct ConnectivityMonitor {
    core: Mutex<MonitorCore>,
    state_tx: watch::Sender<ConnState>,
    recheck: Notify,
}

impl ConnectivityMonitor {
    pub fn new() -> (Arc<Self>, watch::Receiver<ConnState>) {
        let (state_tx, state_rx) = watch::channel(ConnState::Offline);
        let monitor = Arc::new(Self {
            core: Mutex::new(MonitorCore::new()),
            state_tx,
            recheck: Notify::new(),
        });
        (monitor, state_rx)
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    /// Feed a passive online/offline signal from the host environment.
    pub fn set_passive_online(&self, online: bool) {
        let transition = {
            let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
            core.on_passive_signal(online)
        };
        if let Some(state) = transition {
            info!(?state, "Connectivity changed (passive signal)");
            let _ = self.state_tx.send(state);
        }
        if online {
            // Candidate online: confirm now instead of waiting out the
            // health-check interval.
            self.recheck.notify_one();
        }
    }

    fn apply_health_result(&self, reachable: bool) {
        let transition = {
            let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
            core.on_health_check(reachable)
        };
        if let Some(state) = transition {
            info!(?state, "Connectivity changed (health check)");
            let _ = self.state_tx.send(state);
        } else {
            debug!(reachable, "Health check result, no state change");
        }
    }

    /// Spawn the background health-check loop. Health-check failures never
    /// propagate anywhere; they only drive the state machine.
    pub fn start<T: BatchTransport>(
        self: &Arc<Self>,
        transport: Arc<T>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Connectivity monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Connectivity monitor stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                    _ = monitor.recheck.notified() => {}
                }

                let wants_check = {
                    let core = monitor.core.lock().unwrap_or_else(|e| e.into_inner());
                    core.wants_health_check()
                };
                if !wants_check {
                    continue;
                }

                let reachable = transport.check_health().await;
                monitor.apply_health_result(reachable);
            }
        })
    }
}
