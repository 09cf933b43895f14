//! The invalidation table: which cache entries each mutation drops.
//!
//! Every mutating path in [`crate::service::ReservationService`] names its
//! [`Mutation`] and applies exactly `mutation.invalidations()`. Adding a
//! mutation or a cached view means extending this table and its tests.

use crate::cache::CacheType;
use crate::types::{CounterKey, EventId};

/// Cache key for a counter or a shift definition.
///
/// The event id length prefix keeps keys unambiguous when ids contain `/`.
pub fn shift_cache_key(key: &CounterKey) -> String {
    format!(
        "{}:{}/{}",
        key.event_id.len(),
        key.event_id,
        key.shift_id
    )
}

/// Cache key for an event-level aggregate.
pub fn event_cache_key(event_id: &EventId) -> String {
    event_id.to_string()
}

/// One cache removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Invalidation {
    /// Drop a single entry.
    Entry {
        /// Family of the entry
        kind: CacheType,
        /// Key within the family
        key: String,
    },
    /// Drop a whole family.
    Type(CacheType),
}

impl Invalidation {
    fn entry(kind: CacheType, key: String) -> Self {
        Self::Entry { kind, key }
    }
}

/// Operations that change data the cache may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation<'a> {
    /// Counter incremented after a confirmed order.
    Commit(&'a CounterKey),
    /// Counter decremented after a cancellation.
    Cancel(&'a CounterKey),
    /// Counter incremented by a capacity-bounded reservation.
    Reserve(&'a CounterKey),
    /// Counter overwritten from the order ledger.
    Reconcile(&'a CounterKey),
    /// Shift definitions of an event changed in the catalog.
    CatalogChanged(&'a EventId),
}

impl Mutation<'_> {
    /// The exact cache entries this mutation makes stale.
    pub fn invalidations(&self) -> Vec<Invalidation> {
        match self {
            Self::Commit(key) | Self::Cancel(key) | Self::Reserve(key) | Self::Reconcile(key) => {
                vec![
                    Invalidation::entry(CacheType::Counter, shift_cache_key(key)),
                    Invalidation::entry(
                        CacheType::AttendanceOverview,
                        event_cache_key(&key.event_id),
                    ),
                ]
            }
            // shift entries are keyed per shift; the change names only the event
            Self::CatalogChanged(event_id) => vec![
                Invalidation::Type(CacheType::Shift),
                Invalidation::entry(CacheType::AttendanceOverview, event_cache_key(event_id)),
            ],
        }
    }

    /// Operation name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Cancel(_) => "cancel",
            Self::Reserve(_) => "reserve",
            Self::Reconcile(_) => "reconcile",
            Self::CatalogChanged(_) => "catalog_changed",
        }
    }
}
