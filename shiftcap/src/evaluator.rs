//! Pure capacity math.
//!
//! [`evaluate`] turns a counter, a shift definition and a requested quantity
//! into a [`CapacityVerdict`]. No I/O happens here; the same inputs always
//! produce the same verdict.

use serde::{Deserialize, Serialize};

use crate::types::{Shift, ShiftCounter, ShiftId};

/// Outcome of a capacity check for one shift. Computed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityVerdict {
    /// Shift that was evaluated.
    pub shift_id: ShiftId,
    /// Attendee count read from the counter.
    pub current_attendees: u32,
    /// Capacity from the shift definition.
    pub max_capacity: u32,
    /// `max(0, max_capacity - current_attendees)`.
    pub available: u32,
    /// Quantity the caller asked about.
    pub requested_quantity: u32,
    /// Whether the request fits. A zero-quantity request always fits.
    pub can_book: bool,
    /// No places left.
    pub is_full: bool,
    /// The request would take exactly the remaining places.
    pub will_be_full: bool,
}

impl CapacityVerdict {
    /// Places missing to satisfy the request (zero when it fits).
    pub const fn shortfall(&self) -> u32 {
        if self.can_book {
            0
        } else {
            self.requested_quantity.saturating_sub(self.available)
        }
    }

    /// Informational state of the shift given an "almost full" threshold.
    pub const fn state(&self, almost_full_threshold: u32) -> CapacityState {
        CapacityState::classify(self.available, almost_full_threshold)
    }
}

/// Lifecycle of a shift's capacity.
///
/// `AlmostFull` carries no contract change; it exists for dashboards and
/// "only a few left" hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapacityState {
    /// Places are available.
    Open,
    /// Fewer than the threshold places remain.
    AlmostFull,
    /// No places remain.
    Full,
}

impl CapacityState {
    /// Classifies a shift by its remaining places.
    pub const fn classify(available: u32, almost_full_threshold: u32) -> Self {
        if available == 0 {
            Self::Full
        } else if available < almost_full_threshold {
            Self::AlmostFull
        } else {
            Self::Open
        }
    }
}

/// Evaluates whether `requested_quantity` more attendees fit in `shift`.
pub fn evaluate(counter: &ShiftCounter, shift: &Shift, requested_quantity: u32) -> CapacityVerdict {
    let current_attendees = counter.attendee_count;
    let max_capacity = shift.max_capacity;
    let available = max_capacity.saturating_sub(current_attendees);

    // u64 keeps the sum exact for counts near u32::MAX
    let fits = u64::from(current_attendees) + u64::from(requested_quantity)
        <= u64::from(max_capacity);

    CapacityVerdict {
        shift_id: shift.id.clone(),
        current_attendees,
        max_capacity,
        available,
        requested_quantity,
        can_book: requested_quantity == 0 || fits,
        is_full: available == 0,
        will_be_full: available == requested_quantity,
    }
}
