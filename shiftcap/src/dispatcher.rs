//! Fire-and-forget counter commits with retry.
//!
//! Order creation hands its confirmed line items to a [`CommitHandle`] and
//! moves on. A background worker commits one increment per distinct shift,
//! retrying retryable failures per [`crate::retry::RetryConfig`]. Commits
//! that still fail are logged and left for reconciliation; they never fail
//! the order.

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::checkout::{group_by_shift, CartItem};
use crate::service::ReservationService;
use crate::types::{CounterKey, EventId, OrderId};

/// One counter increment to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    /// Order that produced the increment, for logs.
    pub order_id: Option<OrderId>,
    /// Counter to increment.
    pub key: CounterKey,
    /// Units to add.
    pub quantity: u32,
}

/// The dispatcher no longer accepts commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("commit dispatcher is shut down")]
pub struct DispatcherClosed;

/// Totals reported when the dispatcher shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    /// Increments applied.
    pub committed: u64,
    /// Increments given up on.
    pub abandoned: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitOutcome {
    Committed,
    Abandoned,
}

impl DispatchStats {
    fn record(&mut self, joined: Result<CommitOutcome, JoinError>) {
        match joined {
            Ok(CommitOutcome::Committed) => self.committed += 1,
            Ok(CommitOutcome::Abandoned) => self.abandoned += 1,
            Err(join_error) => {
                error!(error = %join_error, "[commit_dispatcher.task_failed] commit task did not finish");
                self.abandoned += 1;
            }
        }
    }
}

/// Cloneable sender side of the dispatcher.
#[derive(Debug, Clone)]
pub struct CommitHandle {
    sender: mpsc::UnboundedSender<CommitRequest>,
}

impl CommitHandle {
    /// Queues one increment.
    pub fn submit(&self, request: CommitRequest) -> Result<(), DispatcherClosed> {
        self.sender.send(request).map_err(|_| DispatcherClosed)
    }

    /// Queues one increment per distinct shift referenced by a confirmed order.
    ///
    /// Returns how many increments were queued.
    pub fn submit_order(
        &self,
        order_id: OrderId,
        event_id: &EventId,
        items: &[CartItem],
    ) -> Result<usize, DispatcherClosed> {
        let grouped = group_by_shift(items);
        let queued = grouped.len();

        for (shift_id, quantity) in grouped {
            self.submit(CommitRequest {
                order_id: Some(order_id),
                key: CounterKey::new(event_id.clone(), shift_id),
                quantity,
            })?;
        }
        Ok(queued)
    }
}

/// Background worker applying queued commits.
#[derive(Debug)]
pub struct CommitDispatcher {
    handle: CommitHandle,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<DispatchStats>,
}

impl CommitDispatcher {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(service: ReservationService) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_signal) = oneshot::channel();
        let worker = tokio::spawn(run_worker(service, receiver, shutdown_signal));

        Self {
            handle: CommitHandle { sender },
            shutdown,
            worker,
        }
    }

    /// A handle for submitting commits.
    pub fn handle(&self) -> CommitHandle {
        self.handle.clone()
    }

    /// Stops accepting commits, finishes everything already queued and reports totals.
    pub async fn shutdown(self) -> DispatchStats {
        let _ = self.shutdown.send(());
        match self.worker.await {
            Ok(stats) => stats,
            Err(join_error) => {
                error!(error = %join_error, "[commit_dispatcher.worker_failed] dispatcher worker did not finish");
                DispatchStats::default()
            }
        }
    }
}

async fn run_worker(
    service: ReservationService,
    mut receiver: mpsc::UnboundedReceiver<CommitRequest>,
    mut shutdown: oneshot::Receiver<()>,
) -> DispatchStats {
    let mut in_flight = JoinSet::new();
    let mut stats = DispatchStats::default();

    loop {
        tokio::select! {
            request = receiver.recv() => match request {
                Some(request) => {
                    in_flight.spawn(commit_with_retry(service.clone(), request));
                }
                None => break,
            },
            _ = &mut shutdown => {
                receiver.close();
                while let Some(request) = receiver.recv().await {
                    in_flight.spawn(commit_with_retry(service.clone(), request));
                }
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => stats.record(joined),
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        stats.record(joined);
    }

    info!(
        committed = stats.committed,
        abandoned = stats.abandoned,
        "[commit_dispatcher.stopped] dispatcher drained"
    );
    stats
}

async fn commit_with_retry(service: ReservationService, request: CommitRequest) -> CommitOutcome {
    let retry = service.config().commit_retry;
    let CommitRequest {
        order_id,
        key,
        quantity,
    } = request;
    let mut attempt = 1;

    loop {
        match service
            .commit(&key.event_id, &key.shift_id, quantity)
            .await
        {
            Ok(()) => return CommitOutcome::Committed,
            Err(commit_error) if retry.should_retry(attempt, &commit_error) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    key = %key,
                    order = ?order_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %commit_error,
                    "[commit_dispatcher.retry] counter commit failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(commit_error) => {
                error!(
                    key = %key,
                    order = ?order_id,
                    quantity,
                    attempt,
                    error = %commit_error,
                    "[commit_dispatcher.abandoned] counter commit abandoned, left for reconciliation"
                );
                return CommitOutcome::Abandoned;
            }
        }
    }
}
