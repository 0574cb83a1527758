//! Liveness monitor
//!
//! Every interval each registered connection either gets terminated (it
//! left too many probes unanswered) or receives a new probe. Any inbound
//! traffic, pongs included, clears the connection's unanswered count.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{Outbound, SendFailure};
use super::protocol::CloseReason;
use super::router::SessionRouter;
use crate::config::RelayConfig;

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub terminated: usize,
}

pub struct LivenessMonitor {
    router: Arc<SessionRouter>,
    interval: Duration,
    missed_allowed: u32,
}

impl LivenessMonitor {
    pub fn new(router: Arc<SessionRouter>, config: &RelayConfig) -> Self {
        Self {
            router,
            interval: config.heartbeat_interval(),
            missed_allowed: config.missed_heartbeats.max(1),
        }
    }

    /// Probe or evict every registered connection once
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.router.connections() {
            if handle.missed_probes() >= self.missed_allowed {
                info!(
                    "Connection {} missed {} heartbeat(s), terminating",
                    handle.id(),
                    handle.missed_probes()
                );
                handle.terminate(CloseReason::HeartbeatTimeout);
                self.router.unbind(handle.id());
                report.terminated += 1;
                continue;
            }

            handle.record_probe();
            match handle.try_send(Outbound::Ping) {
                Ok(()) => {}
                // a backed-up queue still counts as an unanswered probe
                Err(SendFailure::Full) => {
                    debug!("Connection {} queue full, probe skipped", handle.id());
                }
                Err(SendFailure::Closed) => continue,
            }
            report.probed += 1;
        }

        report
    }

    /// Run sweeps on the configured interval until `shutdown` is cancelled
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;

            info!(
                "Liveness monitor started (interval {:?}, {} missed probe(s) allowed)",
                self.interval, self.missed_allowed
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.sweep();
                        if report.terminated > 0 || report.probed > 0 {
                            debug!(
                                "Liveness sweep: {} probed, {} terminated",
                                report.probed, report.terminated
                            );
                        }
                    }
                }
            }

            info!("Liveness monitor stopped");
        })
    }
}
