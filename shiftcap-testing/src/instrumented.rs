//! Collaborator wrappers that count calls.
//!
//! Used to verify round-trip budgets: a cold `check_capacity` performs one
//! catalog read and one counter read, a warm one performs none.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use shiftcap::errors::StoreResult;
use shiftcap::store::{BoundedIncrement, CounterStore, ShiftCatalog};
use shiftcap::types::{CounterKey, Delta, EventId, Shift, ShiftCounter, ShiftId};

/// Snapshot of calls seen by a counting wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    /// `get`, `get_shift` and `get_all_shifts` calls.
    pub reads: u64,
    /// `increment`, `decrement`, `increment_within` and `reconcile` calls.
    pub writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Counters {
    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> CallCounts {
        CallCounts {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }
}

/// Counter store wrapper counting reads and writes.
#[derive(Debug, Default)]
pub struct CountingCounterStore<S> {
    store: S,
    counters: Counters,
}

impl<S> CountingCounterStore<S> {
    /// Wraps `store` with zeroed counts.
    pub fn new(store: S) -> Self {
        Self {
            store,
            counters: Counters::default(),
        }
    }

    /// Calls seen so far.
    pub fn counts(&self) -> CallCounts {
        self.counters.snapshot()
    }

    /// Zeroes the counts.
    pub fn reset(&self) {
        self.counters.reset();
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for CountingCounterStore<S> {
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter> {
        self.counters.read();
        self.store.get(key).await
    }

    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        self.counters.write();
        self.store.increment(key, delta).await
    }

    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        self.counters.write();
        self.store.decrement(key, delta).await
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement> {
        self.counters.write();
        self.store.increment_within(key, delta, max_capacity).await
    }

    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()> {
        self.counters.write();
        self.store.reconcile(key, actual_count).await
    }
}

/// Shift catalog wrapper counting reads.
#[derive(Debug, Default)]
pub struct CountingCatalog<C> {
    catalog: C,
    counters: Counters,
}

impl<C> CountingCatalog<C> {
    /// Wraps `catalog` with zeroed counts.
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            counters: Counters::default(),
        }
    }

    /// Calls seen so far.
    pub fn counts(&self) -> CallCounts {
        self.counters.snapshot()
    }

    /// Zeroes the counts.
    pub fn reset(&self) {
        self.counters.reset();
    }
}

#[async_trait]
impl<C: ShiftCatalog> ShiftCatalog for CountingCatalog<C> {
    async fn get_shift(&self, event_id: &EventId, shift_id: &ShiftId) -> StoreResult<Shift> {
        self.counters.read();
        self.catalog.get_shift(event_id, shift_id).await
    }

    async fn get_all_shifts(&self, event_id: &EventId) -> StoreResult<Vec<Shift>> {
        self.counters.read();
        self.catalog.get_all_shifts(event_id).await
    }
}
