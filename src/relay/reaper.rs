//! Orphan reaper.
//!
//! Periodically purges expired registry entries and releases broker state
//! (connections, channels, locks, notification routes) whose session no
//! longer exists. A connection that still has in-flight executions is left
//! alone until they finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::broker::ConnectionBroker;
use super::exec::ExecEngine;

pub struct OrphanReaper {
    broker: Arc<ConnectionBroker>,
    exec: Arc<ExecEngine>,
}

impl OrphanReaper {
    pub fn new(broker: Arc<ConnectionBroker>, exec: Arc<ExecEngine>) -> Self {
        Self { broker, exec }
    }

    /// One pass. Returns the number of sessions released.
    pub async fn sweep(&self) -> usize {
        let purged = self.broker.registry().purge_expired().await;
        if purged > 0 {
            debug!("Purged {} expired session record(s)", purged);
        }

        let mut closed = 0;
        for session_id in self.broker.tracked_session_ids() {
            if self.broker.registry().exists(&session_id).await {
                continue;
            }
            if self.exec.has_running(&session_id) {
                debug!(
                    "Session {} expired with commands still running, keeping its connection",
                    session_id
                );
                continue;
            }
            self.broker.close(&session_id).await;
            closed += 1;
        }
        if closed > 0 {
            info!("Reaper released {} orphaned session(s)", closed);
        }
        closed
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Reaper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
