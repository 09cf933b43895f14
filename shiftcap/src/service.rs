//! The reservation service: capacity checks, commits and reconciliation.
//!
//! The service is stateless apart from the shared [`ReadThroughCache`]; any
//! number of request handlers may clone and call it concurrently. Every
//! counter mutation goes through the store's atomic primitives and is paired
//! with the invalidations listed by [`Mutation::invalidations`].
//!
//! # Accepted race
//!
//! `check_capacity` and `commit` are separate steps. Two checkouts racing for
//! the last place can both pass the check and both commit, overshooting the
//! capacity by at most the number of racing requests. Reconciliation corrects
//! drift against the order ledger; [`ReservationService::reserve`] is the
//! opt-in atomic alternative when the store supports bounded increments.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheType, ReadThroughCache};
use crate::config::ReservationConfig;
use crate::errors::{ReservationError, ReservationResult, StoreError};
use crate::evaluator::{evaluate, CapacityState, CapacityVerdict};
use crate::invalidation::{event_cache_key, shift_cache_key, Mutation};
use crate::store::{BoundedIncrement, CounterStore, OrderLedger, ShiftCatalog};
use crate::types::{CounterKey, Delta, EventId, Shift, ShiftCounter, ShiftId, Timestamp};

/// One line of a batch capacity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRequest {
    /// Event owning the shift.
    pub event_id: EventId,
    /// Shift to check.
    pub shift_id: ShiftId,
    /// Combined quantity requested for the shift.
    pub quantity: u32,
}

impl CapacityRequest {
    /// Builds a request.
    pub const fn new(event_id: EventId, shift_id: ShiftId, quantity: u32) -> Self {
        Self {
            event_id,
            shift_id,
            quantity,
        }
    }

    /// Counter addressed by this request.
    pub fn key(&self) -> CounterKey {
        CounterKey::new(self.event_id.clone(), self.shift_id.clone())
    }
}

/// Result of one item of a batch check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityCheck {
    /// The request that was checked.
    pub request: CapacityRequest,
    /// Verdict, or the error that prevented one.
    pub outcome: ReservationResult<CapacityVerdict>,
}

impl CapacityCheck {
    /// The request fits: the check succeeded and the verdict allows booking.
    pub fn passed(&self) -> bool {
        matches!(&self.outcome, Ok(verdict) if verdict.can_book)
    }
}

/// Counts over the items of a batch check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Number of requests checked.
    pub total_shifts: usize,
    /// Requests whose verdict allows booking.
    pub available_shifts: usize,
    /// Requests whose shift has no places left.
    pub full_shifts: usize,
}

/// Aggregate result of [`ReservationService::batch_check_capacity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCapacityReport {
    /// Every request passed.
    pub all_can_book: bool,
    /// One entry per request, in request order.
    pub checks: Vec<CapacityCheck>,
    /// Entries that errored or cannot book, in request order.
    pub failed_checks: Vec<CapacityCheck>,
    /// Counts over `checks`.
    pub summary: BatchSummary,
}

impl BatchCapacityReport {
    fn from_checks(checks: Vec<CapacityCheck>) -> Self {
        let failed_checks: Vec<CapacityCheck> =
            checks.iter().filter(|check| !check.passed()).cloned().collect();
        let verdicts = checks.iter().filter_map(|check| check.outcome.as_ref().ok());

        let summary = verdicts.fold(
            BatchSummary {
                total_shifts: checks.len(),
                ..BatchSummary::default()
            },
            |mut summary, verdict| {
                summary.available_shifts += usize::from(verdict.can_book);
                summary.full_shifts += usize::from(verdict.is_full);
                summary
            },
        );

        Self {
            all_can_book: failed_checks.is_empty(),
            checks,
            failed_checks,
            summary,
        }
    }
}

/// One row of the admin attendance overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftAttendance {
    /// Shift identifier.
    pub shift_id: ShiftId,
    /// Shift name.
    pub shift_name: String,
    /// Start of the slot.
    pub start_time: Timestamp,
    /// End of the slot.
    pub end_time: Timestamp,
    /// Capacity from the catalog.
    pub max_capacity: u32,
    /// Attendees counted so far.
    pub current_attendees: u32,
    /// Places left.
    pub available: u32,
    /// No places left.
    pub is_full: bool,
    /// Attendees as a percentage of capacity, two decimals.
    pub utilization_percentage: f64,
    /// Informational capacity state.
    pub state: CapacityState,
}

impl ShiftAttendance {
    fn from_parts(shift: &Shift, counter: &ShiftCounter, almost_full_threshold: u32) -> Self {
        let available = shift.max_capacity.saturating_sub(counter.attendee_count);
        Self {
            shift_id: shift.id.clone(),
            shift_name: shift.name.clone(),
            start_time: shift.start_time,
            end_time: shift.end_time,
            max_capacity: shift.max_capacity,
            current_attendees: counter.attendee_count,
            available,
            is_full: available == 0,
            utilization_percentage: utilization_percentage(
                counter.attendee_count,
                shift.max_capacity,
            ),
            state: CapacityState::classify(available, almost_full_threshold),
        }
    }
}

fn utilization_percentage(current: u32, max_capacity: u32) -> f64 {
    // a zero-capacity shift is reported as fully utilized
    if max_capacity == 0 {
        return 100.0;
    }
    let ratio = f64::from(current) / f64::from(max_capacity);
    (ratio * 10_000.0).round() / 100.0
}

/// Outcome of reconciling one counter against the order ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Reconciled counter.
    pub key: CounterKey,
    /// Count before reconciliation.
    pub previous: u32,
    /// Count computed from the ledger and written back.
    pub actual: u32,
    /// `actual - previous`.
    pub drift: i64,
    /// `|drift|` exceeded the configured threshold.
    pub drift_exceeded: bool,
}

/// Capacity checks and commits over a counter store, catalog and order ledger.
#[derive(Clone)]
pub struct ReservationService {
    counters: Arc<dyn CounterStore>,
    catalog: Arc<dyn ShiftCatalog>,
    ledger: Arc<dyn OrderLedger>,
    cache: Arc<ReadThroughCache>,
    config: ReservationConfig,
}

impl std::fmt::Debug for ReservationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationService")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReservationService {
    /// Creates a service with default configuration and a private cache.
    pub fn new(
        counters: Arc<dyn CounterStore>,
        catalog: Arc<dyn ShiftCatalog>,
        ledger: Arc<dyn OrderLedger>,
    ) -> Self {
        Self {
            counters,
            catalog,
            ledger,
            cache: Arc::new(ReadThroughCache::new()),
            config: ReservationConfig::default(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReservationConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares a cache with other service instances in the same process.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ReadThroughCache>) -> Self {
        self.cache = cache;
        self
    }

    /// The cache backing this service.
    pub const fn cache(&self) -> &Arc<ReadThroughCache> {
        &self.cache
    }

    /// The active configuration.
    pub const fn config(&self) -> &ReservationConfig {
        &self.config
    }

    /// Checks whether `requested_quantity` more attendees fit in a shift.
    ///
    /// Cold cache: one catalog read and one counter read, issued concurrently.
    /// Warm cache: no store reads.
    #[instrument(name = "reservation.check_capacity", skip(self), fields(event = %event_id, shift = %shift_id))]
    pub async fn check_capacity(
        &self,
        event_id: &EventId,
        shift_id: &ShiftId,
        requested_quantity: u32,
    ) -> ReservationResult<CapacityVerdict> {
        let key = CounterKey::new(event_id.clone(), shift_id.clone());
        let (shift, counter) = futures::join!(self.cached_shift(&key), self.cached_counter(&key));

        // an unknown shift wins over a counter failure
        let shift = shift?;
        let counter = counter?;

        let verdict = evaluate(&counter, &shift, requested_quantity);
        debug!(
            current = verdict.current_attendees,
            available = verdict.available,
            can_book = verdict.can_book,
            "[reservation.check_capacity] capacity evaluated"
        );
        Ok(verdict)
    }

    /// Checks several shifts concurrently, isolating failures per item.
    ///
    /// Callers aggregate quantities per shift before calling; each request is
    /// evaluated on its own. Uses the configured batch deadline, if any.
    pub async fn batch_check_capacity(&self, requests: Vec<CapacityRequest>) -> BatchCapacityReport {
        let deadline = self.config.batch_deadline();
        self.run_batch(requests, deadline).await
    }

    /// Like [`Self::batch_check_capacity`] with an explicit overall deadline.
    ///
    /// Items still pending when the deadline fires fail with
    /// [`ReservationError::DeadlineExceeded`].
    pub async fn batch_check_capacity_within(
        &self,
        requests: Vec<CapacityRequest>,
        deadline: std::time::Duration,
    ) -> BatchCapacityReport {
        self.run_batch(requests, Some(deadline)).await
    }

    #[instrument(name = "reservation.batch_check_capacity", skip(self, requests), fields(requests = requests.len()))]
    async fn run_batch(
        &self,
        requests: Vec<CapacityRequest>,
        deadline: Option<std::time::Duration>,
    ) -> BatchCapacityReport {
        let deadline = deadline.map(|budget| Instant::now() + budget);

        let checks = join_all(requests.into_iter().map(|request| async move {
            let check =
                self.check_capacity(&request.event_id, &request.shift_id, request.quantity);
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, check)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ReservationError::DeadlineExceeded { key: request.key() })
                    }),
                None => check.await,
            };
            CapacityCheck { request, outcome }
        }))
        .await;

        let report = BatchCapacityReport::from_checks(checks);
        debug!(
            all_can_book = report.all_can_book,
            failed = report.failed_checks.len(),
            "[reservation.batch_check_capacity] batch evaluated"
        );
        report
    }

    /// Records `quantity` confirmed attendees for a shift.
    ///
    /// Called after the order is durably recorded, once per distinct shift.
    /// A failure here must not fail the order; the counter is corrected by
    /// the next reconciliation. A zero quantity is a no-op.
    #[instrument(name = "reservation.commit", skip(self), fields(event = %event_id, shift = %shift_id))]
    pub async fn commit(
        &self,
        event_id: &EventId,
        shift_id: &ShiftId,
        quantity: u32,
    ) -> ReservationResult<()> {
        let Some(delta) = Delta::from_quantity(quantity) else {
            debug!("[reservation.commit] zero quantity, nothing to commit");
            return Ok(());
        };
        let key = CounterKey::new(event_id.clone(), shift_id.clone());

        let result = self.counters.increment(&key, delta).await;
        self.invalidate(Mutation::Commit(&key));

        let new_count = result?;
        info!(quantity, new_count, "[reservation.commit] counter incremented");
        Ok(())
    }

    /// Releases `quantity` attendees after a cancellation. Floors at zero.
    #[instrument(name = "reservation.cancel", skip(self), fields(event = %event_id, shift = %shift_id))]
    pub async fn cancel(
        &self,
        event_id: &EventId,
        shift_id: &ShiftId,
        quantity: u32,
    ) -> ReservationResult<()> {
        let Some(delta) = Delta::from_quantity(quantity) else {
            debug!("[reservation.cancel] zero quantity, nothing to release");
            return Ok(());
        };
        let key = CounterKey::new(event_id.clone(), shift_id.clone());

        let result = self.counters.decrement(&key, delta).await;
        self.invalidate(Mutation::Cancel(&key));

        let new_count = result?;
        info!(quantity, new_count, "[reservation.cancel] counter decremented");
        Ok(())
    }

    /// Atomically reserves places only if they fit, returning the new count.
    ///
    /// Unlike `check_capacity` followed by `commit`, no concurrent request can
    /// push the counter past the shift's capacity.
    #[instrument(name = "reservation.reserve", skip(self), fields(event = %event_id, shift = %shift_id))]
    pub async fn reserve(
        &self,
        event_id: &EventId,
        shift_id: &ShiftId,
        quantity: u32,
    ) -> ReservationResult<u32> {
        let key = CounterKey::new(event_id.clone(), shift_id.clone());
        let shift = self.cached_shift(&key).await?;

        let Some(delta) = Delta::from_quantity(quantity) else {
            return Ok(self.cached_counter(&key).await?.attendee_count);
        };

        let result = self
            .counters
            .increment_within(&key, delta, shift.max_capacity)
            .await;
        self.invalidate(Mutation::Reserve(&key));

        match result? {
            BoundedIncrement::Applied(new_count) => {
                info!(quantity, new_count, "[reservation.reserve] places reserved");
                Ok(new_count)
            }
            BoundedIncrement::Rejected(current) => {
                let available = shift.max_capacity.saturating_sub(current);
                debug!(quantity, available, "[reservation.reserve] reservation refused");
                Err(ReservationError::CapacityExceeded {
                    key,
                    requested: quantity,
                    available,
                })
            }
        }
    }

    /// Recomputes a counter from the order ledger and overwrites it.
    ///
    /// Linear in the number of orders for the shift; meant for periodic or
    /// administrative use, never the checkout path.
    #[instrument(name = "reservation.reconcile", skip(self), fields(event = %event_id, shift = %shift_id))]
    pub async fn reconcile(
        &self,
        event_id: &EventId,
        shift_id: &ShiftId,
    ) -> ReservationResult<ReconciliationReport> {
        let key = CounterKey::new(event_id.clone(), shift_id.clone());

        let (previous, line_items) = futures::join!(
            self.counters.get(&key),
            self.ledger.line_items_for_shift(&key)
        );
        let previous = previous?.attendee_count;
        let total: u64 = line_items?
            .iter()
            .map(|item| u64::from(item.quantity))
            .sum();
        let actual = u32::try_from(total)
            .map_err(|_| StoreError::CounterOverflow { key: key.clone() })?;

        let result = self.counters.reconcile(&key, actual).await;
        self.invalidate(Mutation::Reconcile(&key));
        result?;

        let drift = i64::from(actual) - i64::from(previous);
        let threshold = u64::from(self.config.drift_threshold.into_inner());
        let drift_exceeded = drift.unsigned_abs() > threshold;

        if drift_exceeded {
            warn!(
                previous,
                actual,
                drift,
                threshold,
                "[reservation.reconcile_drift] counter drifted from order ledger"
            );
        }
        info!(previous, actual, "[reservation.reconcile] counter reconciled");

        Ok(ReconciliationReport {
            key,
            previous,
            actual,
            drift,
            drift_exceeded,
        })
    }

    /// Reconciles every shift of an event, in catalog order.
    #[instrument(name = "reservation.reconcile_event", skip(self), fields(event = %event_id))]
    pub async fn reconcile_event(
        &self,
        event_id: &EventId,
    ) -> ReservationResult<Vec<ReconciliationReport>> {
        let shifts = self.catalog.get_all_shifts(event_id).await?;

        let mut reports = Vec::with_capacity(shifts.len());
        for shift in &shifts {
            reports.push(self.reconcile(event_id, &shift.id).await?);
        }
        Ok(reports)
    }

    /// Per-shift attendance for admin dashboards, cached per event.
    ///
    /// On a miss: one catalog read, then one counter read per shift issued
    /// concurrently. Any counter mutation for the event drops the cached view.
    #[instrument(name = "reservation.attendance_overview", skip(self), fields(event = %event_id))]
    pub async fn attendance_overview(
        &self,
        event_id: &EventId,
    ) -> ReservationResult<Vec<ShiftAttendance>> {
        let threshold = self.config.almost_full_threshold.into_inner();

        self.cache
            .get_or_compute(
                CacheType::AttendanceOverview,
                &event_cache_key(event_id),
                || async move {
                    let shifts = self
                        .catalog
                        .get_all_shifts(event_id)
                        .await
                        .map_err(ReservationError::from)?;

                    let counters = try_join_all(shifts.iter().map(|shift| {
                        let key = CounterKey::new(event_id.clone(), shift.id.clone());
                        async move { self.counters.get(&key).await }
                    }))
                    .await
                    .map_err(ReservationError::from)?;

                    let overview = shifts
                        .iter()
                        .zip(&counters)
                        .map(|(shift, counter)| ShiftAttendance::from_parts(shift, counter, threshold))
                        .collect::<Vec<_>>();
                    Ok::<_, ReservationError>(overview)
                },
            )
            .await
    }

    /// Drops cached shift definitions after the catalog changed for an event.
    #[instrument(name = "reservation.catalog_changed", skip(self), fields(event = %event_id))]
    pub fn catalog_changed(&self, event_id: &EventId) {
        self.invalidate(Mutation::CatalogChanged(event_id));
    }

    fn invalidate(&self, mutation: Mutation<'_>) {
        let invalidations = mutation.invalidations();
        debug!(
            mutation = mutation.name(),
            entries = invalidations.len(),
            "[reservation.invalidate] applying cache invalidations"
        );
        self.cache.apply(&invalidations);
    }

    async fn cached_shift(&self, key: &CounterKey) -> ReservationResult<Shift> {
        self.cache
            .get_or_compute(CacheType::Shift, &shift_cache_key(key), || async move {
                self.catalog
                    .get_shift(&key.event_id, &key.shift_id)
                    .await
                    .map_err(ReservationError::from)
            })
            .await
    }

    async fn cached_counter(&self, key: &CounterKey) -> ReservationResult<ShiftCounter> {
        self.cache
            .get_or_compute(CacheType::Counter, &shift_cache_key(key), || async move {
                self.counters.get(key).await.map_err(ReservationError::from)
            })
            .await
    }
}
