//! background snapshot refresh
//!
//! refreshes the position ledger on a fixed period. ticks that land while a
//! transaction is in flight are skipped so a refresh never races a write the
//! user just authored. refresh failures are logged and the loop keeps going.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::orchestrator::TransactionOrchestrator;

pub struct Poller {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// start polling; the first refresh happens one period from now
    pub fn spawn(orchestrator: Arc<TransactionOrchestrator>, period: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let ledger = orchestrator.ledger().clone();
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "poller started");

            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        if orchestrator.is_in_flight() {
                            debug!("transaction in flight, skipping refresh");
                            continue;
                        }
                        match ledger.refresh().await {
                            Ok(snapshot) => debug!(
                                supplied = %snapshot.position.supplied,
                                borrowed = %snapshot.position.borrowed,
                                "poll refresh"
                            ),
                            Err(e) => warn!(error = %e, "poll refresh failed"),
                        }
                    }
                }
            }
            info!("poller stopped");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// stop polling and wait for the loop to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "poller task ended abnormally");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
