//! Background reaper for stale coordination state: expired asset locks,
//! lapsed queue leases (dead workers), and spent cancellation tokens.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::stores::EngineStores;

pub struct Reaper {
    stores: EngineStores,
    interval: Duration,
}

impl Reaper {
    pub fn new(stores: EngineStores, interval_ms: u64) -> Self {
        Self { stores, interval: Duration::from_millis(interval_ms.max(100)) }
    }

    /// One sweep over all three tables. Public so tests and the doctor
    /// command can run it on demand.
    pub async fn sweep(&self) -> ReapReport {
        let now = Utc::now();
        let mut report = ReapReport::default();

        match self.stores.locks.reap_expired(now).await {
            Ok(count) => report.locks = count,
            Err(error) => {
                tracing::warn!(
                    event_name = "engine.reaper.locks_failed",
                    error = %error,
                    "lock reap sweep failed"
                );
            }
        }

        match self.stores.queue.reap_expired_leases(now).await {
            Ok(count) => report.leases = count,
            Err(error) => {
                tracing::warn!(
                    event_name = "engine.reaper.leases_failed",
                    error = %error,
                    "lease reap sweep failed"
                );
            }
        }

        match self.stores.cancellations.reap_expired(now).await {
            Ok(count) => report.cancellation_tokens = count,
            Err(error) => {
                tracing::warn!(
                    event_name = "engine.reaper.cancellations_failed",
                    error = %error,
                    "cancellation token sweep failed"
                );
            }
        }

        if report.locks + report.leases + report.cancellation_tokens > 0 {
            tracing::info!(
                event_name = "engine.reaper.swept",
                locks = report.locks,
                leases = report.leases,
                cancellation_tokens = report.cancellation_tokens,
                "reaper recovered stale records"
            );
        }

        report
    }

    /// Sweep on a cadence until shutdown flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub locks: u64,
    pub leases: u64,
    pub cancellation_tokens: u64,
}
