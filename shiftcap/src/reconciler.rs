//! Periodic reconciliation of counters against the order ledger.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::service::ReservationService;
use crate::types::EventId;

/// Totals reported when the job stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconciliationStats {
    /// Completed passes over the configured events.
    pub runs: u64,
    /// Shift counters reconciled.
    pub reconciled_shifts: u64,
    /// Shifts whose drift exceeded the threshold.
    pub drifted_shifts: u64,
    /// Events whose reconciliation failed.
    pub failures: u64,
}

/// Background job reconciling every shift of a fixed set of events.
#[derive(Debug)]
pub struct ReconciliationJob {
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<ReconciliationStats>,
}

impl ReconciliationJob {
    /// Starts the job; the first pass runs immediately, then once per `period`.
    pub fn spawn(service: ReservationService, events: Vec<EventId>, period: Duration) -> Self {
        let (shutdown, shutdown_signal) = oneshot::channel();
        let worker = tokio::spawn(run_job(service, events, period, shutdown_signal));
        Self { shutdown, worker }
    }

    /// Stops the job after the pass in progress, if any, and reports totals.
    pub async fn shutdown(self) -> ReconciliationStats {
        let _ = self.shutdown.send(());
        match self.worker.await {
            Ok(stats) => stats,
            Err(join_error) => {
                error!(error = %join_error, "[reconciliation_job.worker_failed] reconciliation worker did not finish");
                ReconciliationStats::default()
            }
        }
    }
}

async fn run_job(
    service: ReservationService,
    events: Vec<EventId>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> ReconciliationStats {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = ReconciliationStats::default();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => run_pass(&service, &events, &mut stats).await,
        }
    }

    info!(
        runs = stats.runs,
        reconciled = stats.reconciled_shifts,
        drifted = stats.drifted_shifts,
        failures = stats.failures,
        "[reconciliation_job.stopped] reconciliation job stopped"
    );
    stats
}

#[instrument(name = "reconciliation_job.pass", skip_all, fields(events = events.len()))]
async fn run_pass(service: &ReservationService, events: &[EventId], stats: &mut ReconciliationStats) {
    for event_id in events {
        match service.reconcile_event(event_id).await {
            Ok(reports) => {
                stats.reconciled_shifts += reports.len() as u64;
                stats.drifted_shifts +=
                    reports.iter().filter(|report| report.drift_exceeded).count() as u64;
            }
            Err(reconcile_error) => {
                stats.failures += 1;
                error!(
                    event = %event_id,
                    error = %reconcile_error,
                    "[reconciliation_job.failed] event reconciliation failed"
                );
            }
        }
    }
    stats.runs += 1;
}
