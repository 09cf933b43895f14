//! Collaborator contracts consumed by the reservation service.
//!
//! - [`CounterStore`]: durable per-shift counters with atomic mutations
//! - [`ShiftCatalog`]: read-only event/shift definitions
//! - [`OrderLedger`]: append-only record of confirmed purchases
//!
//! The traits hide how a backend achieves atomicity (PostgreSQL uses
//! row-level upserts and row locks, the in-memory store holds a write lock for
//! the whole read-modify-write). The reservation service never implements an
//! increment as read-then-write on top of these traits.
//!
//! Implementations include:
//! - `shiftcap-postgres`: production PostgreSQL counter store
//! - `shiftcap-memory`: in-memory counter store, catalog and ledger

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::StoreResult;
use crate::types::{CounterKey, Delta, EventId, LedgerLineItem, Shift, ShiftCounter, ShiftId};

/// Result of a capacity-bounded increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedIncrement {
    /// The delta fit under the bound and was applied; carries the new count.
    Applied(u32),
    /// The delta did not fit; nothing was written. Carries the current count.
    Rejected(u32),
}

/// Durable, race-free per-shift counters.
///
/// # Atomicity
///
/// `increment`, `decrement`, `increment_within` and `reconcile` on the same
/// key serialize with respect to each other: two concurrent increments never
/// lose one of the deltas. Operations on different keys carry no ordering
/// guarantee. `get` never observes a torn value.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Returns the counter, or a zero counter if it was never written.
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter>;

    /// Atomically adds `delta` and stamps `last_updated`. Returns the new count.
    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32>;

    /// Atomically subtracts `delta`, flooring at zero. Returns the new count.
    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32>;

    /// Atomically adds `delta` only if the result stays within `max_capacity`.
    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement>;

    /// Unconditionally overwrites the count and stamps `last_reconciled`.
    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()>;
}

/// Read access to event and shift definitions.
#[async_trait]
pub trait ShiftCatalog: Send + Sync {
    /// Returns one shift, or `EventNotFound` / `ShiftNotFound`.
    async fn get_shift(&self, event_id: &EventId, shift_id: &ShiftId) -> StoreResult<Shift>;

    /// Returns the event's shifts in catalog order, or `EventNotFound`.
    async fn get_all_shifts(&self, event_id: &EventId) -> StoreResult<Vec<Shift>>;
}

/// Read access to confirmed purchases, used only by reconciliation.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Confirmed line items referencing the shift.
    async fn line_items_for_shift(&self, key: &CounterKey) -> StoreResult<Vec<LedgerLineItem>>;
}

#[async_trait]
impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter> {
        (**self).get(key).await
    }

    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        (**self).increment(key, delta).await
    }

    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        (**self).decrement(key, delta).await
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement> {
        (**self).increment_within(key, delta, max_capacity).await
    }

    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()> {
        (**self).reconcile(key, actual_count).await
    }
}

#[async_trait]
impl<T: ShiftCatalog + ?Sized> ShiftCatalog for Arc<T> {
    async fn get_shift(&self, event_id: &EventId, shift_id: &ShiftId) -> StoreResult<Shift> {
        (**self).get_shift(event_id, shift_id).await
    }

    async fn get_all_shifts(&self, event_id: &EventId) -> StoreResult<Vec<Shift>> {
        (**self).get_all_shifts(event_id).await
    }
}

#[async_trait]
impl<T: OrderLedger + ?Sized> OrderLedger for Arc<T> {
    async fn line_items_for_shift(&self, key: &CounterKey) -> StoreResult<Vec<LedgerLineItem>> {
        (**self).line_items_for_shift(key).await
    }
}
