//! Core types for the `shiftcap` reservation library.
//!
//! Identifiers use smart constructors so that once a value exists it is valid,
//! following the "parse, don't validate" principle. The catalog types
//! (`Event`, `Shift`) are read-only from this crate's point of view; the only
//! state owned here is the per-shift [`ShiftCounter`].

use std::collections::HashSet;
use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of an event in the event/shift catalog.
///
/// Guaranteed to be non-empty (after trimming) and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(String);

/// Identifier of a shift, unique within its event.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ShiftId(String);

/// Identifier of a catalog product referenced by a cart line item.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(String);

/// Identifier of a confirmed order in the order ledger (UUIDv7).
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates a new time-ordered order identifier.
    pub fn new() -> Self {
        // Uuid::now_v7() always carries the v7 version bits
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

/// A strictly positive quantity applied to a counter.
///
/// Counter mutations only accept a `Delta`, so a zero-sized increment or
/// decrement cannot reach a store.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Into))]
pub struct Delta(NonZeroU32);

impl Delta {
    /// Converts a raw quantity, returning `None` for zero.
    pub fn from_quantity(quantity: u32) -> Option<Self> {
        NonZeroU32::new(quantity).map(Self::new)
    }

    /// Returns the quantity as a plain integer.
    pub fn get(self) -> u32 {
        self.into_inner().get()
    }
}

/// A point in time, always UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of a single shift counter: `(event, shift)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// Event owning the shift.
    pub event_id: EventId,
    /// Shift within the event.
    pub shift_id: ShiftId,
}

impl CounterKey {
    /// Builds a key from its parts.
    pub const fn new(event_id: EventId, shift_id: ShiftId) -> Self {
        Self { event_id, shift_id }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.event_id, self.shift_id)
    }
}

/// A bounded-capacity time slot within an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    /// Shift identifier, unique within the owning event.
    pub id: ShiftId,
    /// Human-readable name shown on dashboards.
    pub name: String,
    /// Start of the slot.
    pub start_time: Timestamp,
    /// End of the slot.
    pub end_time: Timestamp,
    /// Maximum number of attendees the shift accepts.
    pub max_capacity: u32,
}

/// Errors raised while assembling an [`Event`] definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDefinitionError {
    /// Two shifts of the same event share an identifier.
    #[error("event {event_id} defines shift {shift_id} more than once")]
    DuplicateShift {
        /// The event being defined
        event_id: EventId,
        /// The repeated shift identifier
        shift_id: ShiftId,
    },
}

/// An event with its ordered list of shifts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    name: String,
    shifts: Vec<Shift>,
}

impl Event {
    /// Creates an event, rejecting duplicate shift identifiers.
    pub fn try_new(
        id: EventId,
        name: impl Into<String>,
        shifts: Vec<Shift>,
    ) -> Result<Self, EventDefinitionError> {
        let mut seen = HashSet::with_capacity(shifts.len());
        for shift in &shifts {
            if !seen.insert(&shift.id) {
                return Err(EventDefinitionError::DuplicateShift {
                    event_id: id,
                    shift_id: shift.id.clone(),
                });
            }
        }

        Ok(Self {
            id,
            name: name.into(),
            shifts,
        })
    }

    /// Event identifier.
    pub const fn id(&self) -> &EventId {
        &self.id
    }

    /// Event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shifts in catalog order.
    pub fn shifts(&self) -> &[Shift] {
        &self.shifts
    }

    /// Looks up a shift by identifier.
    pub fn shift(&self, shift_id: &ShiftId) -> Option<&Shift> {
        self.shifts.iter().find(|shift| &shift.id == shift_id)
    }
}

/// Durable running total of attendees for one shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftCounter {
    /// Which shift this counter tracks.
    pub key: CounterKey,
    /// Sum of confirmed quantities; never negative.
    pub attendee_count: u32,
    /// Last increment, decrement or reconciliation.
    pub last_updated: Timestamp,
    /// Last reconciliation against the order ledger, if any.
    pub last_reconciled: Option<Timestamp>,
}

impl ShiftCounter {
    /// A freshly materialized counter for a key that has never been written.
    pub fn zero(key: CounterKey) -> Self {
        Self {
            key,
            attendee_count: 0,
            last_updated: Timestamp::now(),
            last_reconciled: None,
        }
    }
}

/// One confirmed line item referencing a shift, as reported by the order ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLineItem {
    /// Order the line belongs to.
    pub order_id: OrderId,
    /// Units purchased for the shift.
    pub quantity: u32,
}
