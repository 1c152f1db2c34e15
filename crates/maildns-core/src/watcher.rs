//! Drift watch loop
//!
//! The DriftWatcher keeps published DNS in line with the relay's network
//! identity after the one-shot initializer has run:
//! - Waits for the initializer's state document
//! - Re-detects addresses on a fixed interval
//! - Reconciles on address drift or when published records diverge
//! - Requests a restart of the relay when its incoming address moved
//!
//! ## State Machine
//!
//! ```text
//! ┌──────────────────────┐   state found   ┌─────────┐
//! │ AwaitingInitialState │ ───────────────►│ Polling │◄──────┐
//! └──────────────────────┘                 └─────────┘       │
//!            │                                  │ drift      │
//!            │ cancel                           ▼            │
//!            │                          ┌─────────────┐      │
//!            │                          │ Reconciling │──────┘
//!            ▼                          └─────────────┘
//!       ┌─────────┐        cancel (from any state)
//!       │ Stopped │◄───────────────────────────────
//!       └─────────┘
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::error::Result;
use crate::manager::DnsManager;
use crate::traits::{DetectedState, StateStore};

/// Number of record issues quoted in a drift reason
const MAX_REPORTED_ISSUES: usize = 3;

/// Phase of the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for the initializer's state document
    AwaitingInitialState,
    /// Sleeping between ticks or checking for drift
    Polling,
    /// Applying the desired state after drift
    Reconciling,
    /// Shut down
    Stopped,
}

/// Events emitted by the DriftWatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Watch loop started
    Started,

    /// Initial state loaded from the store
    InitialState {
        incoming_ip: IpAddr,
    },

    /// Drift detected, reconciliation follows
    DriftDetected {
        reasons: Vec<String>,
    },

    /// Reconciliation succeeded and the new state was persisted
    Reconciled {
        incoming_changed: bool,
    },

    /// Reconciliation failed; retried on the next tick
    ReconcileFailed,

    /// Restart marker written for the relay process
    RestartRequested {
        incoming_ip: IpAddr,
    },

    /// Periodic no-drift heartbeat
    Heartbeat {
        checks: u64,
    },

    /// Watch loop stopped
    Stopped,
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No incoming address could be detected, or shutdown was requested
    Skipped,
    /// No drift and published records match
    Unchanged,
    /// Drift reconciled
    Reconciled {
        /// Whether a restart was requested
        restart_requested: bool,
    },
    /// Reconciliation or persistence failed
    Failed,
}

/// Drift watch loop
pub struct DriftWatcher {
    manager: Arc<DnsManager>,
    store: Arc<dyn StateStore>,
    config: WatchConfig,
    saved: Mutex<Option<DetectedState>>,
    state_tx: watch::Sender<WatchState>,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl DriftWatcher {
    /// Create a new watcher
    ///
    /// # Returns
    ///
    /// A tuple of (watcher, event_receiver) where event_receiver yields watch events
    pub fn new(
        manager: Arc<DnsManager>,
        store: Arc<dyn StateStore>,
        config: WatchConfig,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (state_tx, _) = watch::channel(WatchState::AwaitingInitialState);

        let watcher = Self {
            manager,
            store,
            config,
            saved: Mutex::new(None),
            state_tx,
            event_tx,
        };
        Ok((watcher, event_rx))
    }

    /// Current phase
    pub fn state(&self) -> WatchState {
        *self.state_tx.borrow()
    }

    /// Subscribe to phase changes
    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state_tx.subscribe()
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.emit_event(WatchEvent::Started);
        info!(
            "DNS watcher starting, check interval {}s",
            self.config.interval.as_secs()
        );

        let Some(initial) = self.wait_for_initial_state(&cancel).await else {
            info!("Shutdown requested before initial state was available");
            self.stop();
            return Ok(());
        };

        info!(
            "Initial incoming IP {}, outbound IP {}",
            initial.incoming_ip,
            initial
                .outbound_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "not tracked".to_string())
        );
        self.emit_event(WatchEvent::InitialState {
            incoming_ip: initial.incoming_ip,
        });
        *self.saved.lock().await = Some(initial);

        let mut tick: u64 = 0;
        loop {
            self.set_state(WatchState::Polling);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            tick += 1;
            self.poll_once(tick, &cancel).await;

            if cancel.is_cancelled() {
                break;
            }
        }

        self.stop();
        Ok(())
    }

    /// Run a single tick
    ///
    /// `tick` counts completed polls and drives the heartbeat cadence.
    pub async fn poll_once(&self, tick: u64, cancel: &CancellationToken) -> PollOutcome {
        if cancel.is_cancelled() {
            return PollOutcome::Skipped;
        }

        let Some(current) = self.manager.detect(Duration::ZERO).await else {
            warn!("Could not detect current incoming IP, skipping check");
            return PollOutcome::Skipped;
        };

        let saved = self.refresh_saved().await;
        let mut reasons = match &saved {
            Some(saved) => evaluate_drift(saved, &current),
            None => vec!["no saved state".to_string()],
        };

        if reasons.is_empty() {
            let (correct, issues) = self
                .manager
                .check_records(current.incoming_ip, &current.all_ips)
                .await;
            if !correct {
                let quoted: Vec<_> = issues.iter().take(MAX_REPORTED_ISSUES).cloned().collect();
                reasons.push(format!("DNS records incorrect: {}", quoted.join("; ")));
            }
        }

        if reasons.is_empty() {
            if tick % self.config.heartbeat_every == 0 {
                info!(
                    "Heartbeat: IPs unchanged (in: {}), DNS verified OK, {} checks completed",
                    current.incoming_ip, tick
                );
                self.emit_event(WatchEvent::Heartbeat { checks: tick });
            } else {
                debug!("IPs unchanged: in={}", current.incoming_ip);
            }
            return PollOutcome::Unchanged;
        }

        info!("Change detected, DNS update required");
        for reason in &reasons {
            info!("  - {}", reason);
        }
        self.emit_event(WatchEvent::DriftDetected { reasons });

        self.reconcile(saved.as_ref(), current, cancel).await
    }

    async fn reconcile(
        &self,
        saved: Option<&DetectedState>,
        current: DetectedState,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        self.set_state(WatchState::Reconciling);

        if !self.manager.apply(&current).await {
            error!("DNS update failed, will retry on next check");
            self.emit_event(WatchEvent::ReconcileFailed);
            return PollOutcome::Failed;
        }

        if let Err(e) = self.store.save(&current).await {
            error!("Failed to persist detected state: {}", e);
            self.emit_event(WatchEvent::ReconcileFailed);
            return PollOutcome::Failed;
        }

        let incoming_changed = saved.is_none_or(|s| s.incoming_ip != current.incoming_ip);
        let incoming_ip = current.incoming_ip;
        *self.saved.lock().await = Some(current);

        let mut restart_requested = false;
        if incoming_changed {
            info!("Incoming IP changed, requesting relay restart");
            match self.store.request_restart().await {
                Ok(()) => {
                    restart_requested = true;
                    self.emit_event(WatchEvent::RestartRequested { incoming_ip });
                    debug!(
                        "Waiting up to {}s for the relay to restart",
                        self.config.restart_grace.as_secs()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.config.restart_grace) => {}
                    }
                }
                Err(e) => error!("Failed to write restart marker: {}", e),
            }
        } else {
            info!("DNS records updated, no restart needed");
        }

        self.emit_event(WatchEvent::Reconciled { incoming_changed });
        PollOutcome::Reconciled { restart_requested }
    }

    async fn wait_for_initial_state(&self, cancel: &CancellationToken) -> Option<DetectedState> {
        self.set_state(WatchState::AwaitingInitialState);
        info!("Waiting for initial state from the initializer");

        loop {
            match self.store.load().await {
                Ok(Some(state)) => return Some(state),
                Ok(None) => {}
                Err(e) => debug!("Initial state not readable yet: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.initial_state_poll) => {}
            }
        }
    }

    /// Reload the persisted state, keeping the last known one on failure
    async fn refresh_saved(&self) -> Option<DetectedState> {
        let mut saved = self.saved.lock().await;
        match self.store.load().await {
            Ok(Some(state)) => *saved = Some(state),
            Ok(None) => {}
            Err(e) => warn!("Failed to reload saved state, using last known: {}", e),
        }
        saved.clone()
    }

    fn stop(&self) {
        self.set_state(WatchState::Stopped);
        self.emit_event(WatchEvent::Stopped);
        info!("DNS watcher stopped");
    }

    fn set_state(&self, state: WatchState) {
        self.state_tx.send_replace(state);
    }

    fn emit_event(&self, event: WatchEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Watch event channel full, dropping event");
        }
    }
}

/// Reasons the published state no longer matches the detected one
///
/// Reasons are reported in a fixed order: incoming address, outbound
/// address (only when one is detected now), then the full address set.
pub fn evaluate_drift(saved: &DetectedState, current: &DetectedState) -> Vec<String> {
    let mut reasons = Vec::new();

    if current.incoming_ip != saved.incoming_ip {
        reasons.push(format!(
            "incoming IP: {} -> {}",
            saved.incoming_ip, current.incoming_ip
        ));
    }

    if let Some(outbound) = current.outbound_ip
        && saved.outbound_ip != Some(outbound)
    {
        reasons.push(format!(
            "outbound IP: {} -> {}",
            saved
                .outbound_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            outbound
        ));
    }

    if current.all_ips != saved.all_ips {
        reasons.push(format!(
            "all IPs: {:?} -> {:?}",
            saved.all_ips, current.all_ips
        ));
    }

    reasons
}
