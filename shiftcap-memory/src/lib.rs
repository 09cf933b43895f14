//! In-memory adapters for `shiftcap`
//!
//! This crate provides in-memory implementations of the [`CounterStore`],
//! [`ShiftCatalog`] and [`OrderLedger`] traits from the shiftcap crate,
//! useful for testing and development scenarios where persistence is not
//! required.
//!
//! Counter mutations hold the map's write lock for the whole
//! read-modify-write, which gives the same per-key atomicity the PostgreSQL
//! store gets from row-level upserts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use shiftcap::errors::{Operation, StoreError, StoreResult};
use shiftcap::store::{BoundedIncrement, CounterStore, OrderLedger, ShiftCatalog};
use shiftcap::types::{
    CounterKey, Delta, Event, EventId, LedgerLineItem, OrderId, Shift, ShiftCounter, ShiftId,
    Timestamp,
};
use tracing::{debug, error};

fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    operation: Operation,
) -> StoreResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| {
        error!(%operation, "[memory_store.poisoned] lock poisoned by a panicked writer");
        StoreError::StoreFailure { operation }
    })
}

fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    operation: Operation,
) -> StoreResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| {
        error!(%operation, "[memory_store.poisoned] lock poisoned by a panicked writer");
        StoreError::StoreFailure { operation }
    })
}

/// Thread-safe in-memory counter store.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<RwLock<HashMap<CounterKey, ShiftCounter>>>,
}

impl InMemoryCounterStore {
    /// Create a new empty counter store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters that have been written at least once.
    pub fn len(&self) -> usize {
        self.counters.read().map_or(0, |counters| counters.len())
    }

    /// True when no counter has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter> {
        let counters = read_lock(&self.counters, Operation::ReadCounter)?;

        // a missing counter is never materialized by a read
        Ok(counters
            .get(key)
            .cloned()
            .unwrap_or_else(|| ShiftCounter::zero(key.clone())))
    }

    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        let mut counters = write_lock(&self.counters, Operation::IncrementCounter)?;
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| ShiftCounter::zero(key.clone()));

        let updated = counter
            .attendee_count
            .checked_add(delta.get())
            .ok_or_else(|| StoreError::CounterOverflow { key: key.clone() })?;
        counter.attendee_count = updated;
        counter.last_updated = Timestamp::now();

        debug!(key = %key, delta = delta.get(), count = updated, "[memory_store.increment] counter incremented");
        Ok(updated)
    }

    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        let mut counters = write_lock(&self.counters, Operation::DecrementCounter)?;
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| ShiftCounter::zero(key.clone()));

        counter.attendee_count = counter.attendee_count.saturating_sub(delta.get());
        counter.last_updated = Timestamp::now();

        debug!(key = %key, delta = delta.get(), count = counter.attendee_count, "[memory_store.decrement] counter decremented");
        Ok(counter.attendee_count)
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement> {
        let mut counters = write_lock(&self.counters, Operation::ReserveCounter)?;
        let current = counters.get(key).map_or(0, |counter| counter.attendee_count);

        if u64::from(current) + u64::from(delta.get()) > u64::from(max_capacity) {
            return Ok(BoundedIncrement::Rejected(current));
        }

        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| ShiftCounter::zero(key.clone()));
        // bounded by max_capacity, which is a u32
        counter.attendee_count = current + delta.get();
        counter.last_updated = Timestamp::now();

        Ok(BoundedIncrement::Applied(counter.attendee_count))
    }

    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()> {
        let mut counters = write_lock(&self.counters, Operation::ReconcileCounter)?;
        let now = Timestamp::now();

        counters.insert(
            key.clone(),
            ShiftCounter {
                key: key.clone(),
                attendee_count: actual_count,
                last_updated: now,
                last_reconciled: Some(now),
            },
        );
        Ok(())
    }
}

/// In-memory shift catalog keyed by event.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    events: Arc<RwLock<HashMap<EventId, Event>>>,
}

impl InMemoryCatalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an event definition.
    ///
    /// Services caching this catalog must be told through
    /// `ReservationService::catalog_changed`.
    pub fn insert_event(&self, event: Event) -> StoreResult<()> {
        let mut events = write_lock(&self.events, Operation::WriteCatalog)?;
        events.insert(event.id().clone(), event);
        Ok(())
    }

    /// Removes an event, returning its definition if it existed.
    pub fn remove_event(&self, event_id: &EventId) -> StoreResult<Option<Event>> {
        let mut events = write_lock(&self.events, Operation::WriteCatalog)?;
        Ok(events.remove(event_id))
    }
}

#[async_trait]
impl ShiftCatalog for InMemoryCatalog {
    async fn get_shift(&self, event_id: &EventId, shift_id: &ShiftId) -> StoreResult<Shift> {
        let events = read_lock(&self.events, Operation::ReadShift)?;
        let event = events.get(event_id).ok_or_else(|| StoreError::EventNotFound {
            event_id: event_id.clone(),
        })?;

        event
            .shift(shift_id)
            .cloned()
            .ok_or_else(|| StoreError::ShiftNotFound {
                event_id: event_id.clone(),
                shift_id: shift_id.clone(),
            })
    }

    async fn get_all_shifts(&self, event_id: &EventId) -> StoreResult<Vec<Shift>> {
        let events = read_lock(&self.events, Operation::ReadShifts)?;
        events
            .get(event_id)
            .map(|event| event.shifts().to_vec())
            .ok_or_else(|| StoreError::EventNotFound {
                event_id: event_id.clone(),
            })
    }
}

#[derive(Debug, Clone)]
struct RecordedOrder {
    event_id: EventId,
    lines: Vec<(ShiftId, u32)>,
    confirmed: bool,
}

/// In-memory order ledger.
///
/// Only confirmed orders contribute line items; cancelling an order removes
/// its lines from every later scan.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderLedger {
    orders: Arc<RwLock<HashMap<OrderId, RecordedOrder>>>,
}

impl InMemoryOrderLedger {
    /// Create a new empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a confirmed order with its `(shift, quantity)` lines.
    pub fn record_order(
        &self,
        order_id: OrderId,
        event_id: EventId,
        lines: Vec<(ShiftId, u32)>,
    ) -> StoreResult<()> {
        let mut orders = write_lock(&self.orders, Operation::WriteLedger)?;
        orders.insert(
            order_id,
            RecordedOrder {
                event_id,
                lines,
                confirmed: true,
            },
        );
        Ok(())
    }

    /// Marks an order cancelled. Returns false if the order is unknown.
    pub fn cancel_order(&self, order_id: &OrderId) -> StoreResult<bool> {
        let mut orders = write_lock(&self.orders, Operation::WriteLedger)?;
        Ok(orders.get_mut(order_id).is_some_and(|order| {
            order.confirmed = false;
            true
        }))
    }
}

#[async_trait]
impl OrderLedger for InMemoryOrderLedger {
    async fn line_items_for_shift(&self, key: &CounterKey) -> StoreResult<Vec<LedgerLineItem>> {
        let orders = read_lock(&self.orders, Operation::ReadLedger)?;

        let mut items: Vec<LedgerLineItem> = orders
            .iter()
            .filter(|(_, order)| order.confirmed && order.event_id == key.event_id)
            .flat_map(|(order_id, order)| {
                order
                    .lines
                    .iter()
                    .filter(|(shift_id, _)| *shift_id == key.shift_id)
                    .map(|(_, quantity)| LedgerLineItem {
                        order_id: *order_id,
                        quantity: *quantity,
                    })
            })
            .collect();
        // v7 order ids sort by creation time
        items.sort_by_key(|item| item.order_id);
        Ok(items)
    }
}
