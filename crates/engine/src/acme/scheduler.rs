//! Periodic certificate reconciliation
//!
//! Every tick advances each configured domain once, in order. A tick that
//! changes any certificate notifies the other cluster nodes through the
//! coordinator and local consumers through a broadcast channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::manager::CertificateStateMachine;
use crate::cluster::{ClusterCoordinator, CoordinationError, EventCallback};

/// Cluster event fired after a tick that changed certificates
pub const CERTIFICATES_CHANGED_EVENT: &str = "certificates-changed";

/// Where a certificate change was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A tick on this node
    Local,
    /// Another node fired [`CERTIFICATES_CHANGED_EVENT`]
    Peer,
    /// The coordination session came back; changes may have been missed
    Reconnected,
}

/// Published to local subscribers when certificates may have changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatesChanged {
    pub origin: ChangeOrigin,
    /// Domains whose state changed, empty when not known
    pub domains: Vec<String>,
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Domains advanced without error
    pub advanced: usize,
    /// Domains whose state changed
    pub changed: Vec<String>,
    /// Domains whose step failed
    pub failed: Vec<String>,
}

/// Republishes peer events on the local channel
struct PeerChangeListener {
    changes: broadcast::Sender<CertificatesChanged>,
}

impl EventCallback for PeerChangeListener {
    fn event_fired(&self, event_id: &str) {
        trace!(event = %event_id, "Certificates changed on a peer");
        let _ = self.changes.send(CertificatesChanged {
            origin: ChangeOrigin::Peer,
            domains: Vec::new(),
        });
    }

    fn reconnected(&self) {
        debug!("Coordination session re-established, reloading certificates");
        let _ = self.changes.send(CertificatesChanged {
            origin: ChangeOrigin::Reconnected,
            domains: Vec::new(),
        });
    }
}

/// Periodic driver of the [`CertificateStateMachine`]
pub struct ReconciliationLoop {
    machine: Arc<CertificateStateMachine>,
    coordinator: Arc<dyn ClusterCoordinator>,
    changes: broadcast::Sender<CertificatesChanged>,
}

impl ReconciliationLoop {
    pub fn new(
        machine: Arc<CertificateStateMachine>,
        coordinator: Arc<dyn ClusterCoordinator>,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            machine,
            coordinator,
            changes,
        }
    }

    pub fn machine(&self) -> &Arc<CertificateStateMachine> {
        &self.machine
    }

    /// Subscribe to certificate change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CertificatesChanged> {
        self.changes.subscribe()
    }

    /// Start listening for changes made by other nodes
    pub async fn watch_peers(&self) -> Result<(), CoordinationError> {
        let listener = Arc::new(PeerChangeListener {
            changes: self.changes.clone(),
        });
        self.coordinator
            .watch_event(CERTIFICATES_CHANGED_EVENT, listener)
            .await
    }

    /// Advance every configured domain once
    ///
    /// Per-domain failures are logged and never stop the tick.
    pub async fn run_once(&self) -> TickReport {
        let start = Instant::now();
        let mut report = TickReport::default();

        if let Err(e) = self.machine.login().await {
            warn!(error = %e, "ACME login failed, skipping tick");
            return report;
        }

        for domain in self.machine.domains() {
            match self.machine.advance(&domain).await {
                Ok(changed) => {
                    report.advanced += 1;
                    if changed {
                        report.changed.push(domain);
                    }
                }
                Err(e) => {
                    warn!(
                        domain = %domain,
                        error = %e,
                        transient = e.is_transient(),
                        "Certificate step failed"
                    );
                    report.failed.push(domain);
                }
            }
        }

        if !report.changed.is_empty() {
            if let Err(e) = self.coordinator.fire_event(CERTIFICATES_CHANGED_EVENT).await {
                warn!(error = %e, "Failed to notify peers of certificate changes");
            }
            let _ = self.changes.send(CertificatesChanged {
                origin: ChangeOrigin::Local,
                domains: report.changed.clone(),
            });
        }

        debug!(
            advanced = report.advanced,
            changed = report.changed.len(),
            failed = report.failed.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Reconciliation tick complete"
        );
        report
    }

    /// Tick until `shutdown` turns true or its sender is dropped
    ///
    /// The first tick runs immediately. A period change in a reloaded
    /// configuration takes effect after the current tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_secs = period.as_secs(),
            peer_id = %self.coordinator.local_peer_id(),
            "Starting certificate reconciliation loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;

                    let current = self.period();
                    if current != period {
                        info!(period_secs = current.as_secs(), "Reconciliation period changed");
                        period = current;
                        ticker = interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        ticker.tick().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Certificate reconciliation loop stopped");
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.machine.configuration().period_secs.max(1))
    }
}

impl std::fmt::Debug for ReconciliationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationLoop")
            .field("machine", &self.machine)
            .field("peer_id", self.coordinator.local_peer_id())
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

/// Log local change notifications until the channel closes
///
/// Used by the binary; a proxy would reload its TLS contexts here instead.
pub async fn log_changes(mut changes: broadcast::Receiver<CertificatesChanged>) {
    loop {
        match changes.recv().await {
            Ok(event) => info!(
                origin = ?event.origin,
                domains = ?event.domains,
                "Certificates changed"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Certificate change notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Certificate change channel closed");
}
