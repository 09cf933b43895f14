//! Error types for shiftcap.
//!
//! Two layers of errors exist:
//!
//! - **StoreError**: returned by the collaborators (counter store, shift
//!   catalog, order ledger). Backends map their native failures into it.
//! - **ReservationError**: returned by the reservation service and the
//!   checkout client. It classifies failures by what a caller can do about
//!   them: correct the input (`NotFound`), retry with backoff
//!   (`TransientStore`, `DeadlineExceeded`) or reduce the requested quantity
//!   (`CapacityExceeded`).
//!
//! Reconciliation drift is not an error. It is reported through
//! [`crate::service::ReconciliationReport`] and a `warn!` log line.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! match service.check_capacity(&event_id, &shift_id, 2).await {
//!     Ok(verdict) if verdict.can_book => proceed(),
//!     Ok(verdict) => show_shortfall(verdict.available),
//!     Err(error) if error.is_retryable() => retry_later(),
//!     Err(error) => show_validation_error(&error),
//! }
//! ```

use crate::types::{CounterKey, EventId, ShiftId};
use thiserror::Error;

/// Identifies the collaborator operation that failed.
///
/// Used by `StoreFailure` variants to report which call hit an
/// infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Reading a shift counter.
    ReadCounter,
    /// Incrementing a shift counter.
    IncrementCounter,
    /// Decrementing a shift counter.
    DecrementCounter,
    /// Capacity-bounded increment of a shift counter.
    ReserveCounter,
    /// Overwriting a shift counter with reconciled truth.
    ReconcileCounter,
    /// Reading one shift definition from the catalog.
    ReadShift,
    /// Reading all shift definitions of an event.
    ReadShifts,
    /// Adding or removing an event definition in the catalog.
    WriteCatalog,
    /// Scanning the order ledger.
    ReadLedger,
    /// Recording or cancelling an order in the ledger.
    WriteLedger,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
    /// Applying schema migrations.
    Migrate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadCounter => write!(f, "read_counter"),
            Self::IncrementCounter => write!(f, "increment_counter"),
            Self::DecrementCounter => write!(f, "decrement_counter"),
            Self::ReserveCounter => write!(f, "reserve_counter"),
            Self::ReconcileCounter => write!(f, "reconcile_counter"),
            Self::ReadShift => write!(f, "read_shift"),
            Self::ReadShifts => write!(f, "read_shifts"),
            Self::WriteCatalog => write!(f, "write_catalog"),
            Self::ReadLedger => write!(f, "read_ledger"),
            Self::WriteLedger => write!(f, "write_ledger"),
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
            Self::Migrate => write!(f, "migrate"),
        }
    }
}

/// Error type returned by counter stores, catalogs and ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The catalog has no event with this identifier.
    #[error("event {event_id} not found")]
    EventNotFound {
        /// The missing event
        event_id: EventId,
    },

    /// The event exists but has no shift with this identifier.
    #[error("shift {shift_id} not found in event {event_id}")]
    ShiftNotFound {
        /// The event that was searched
        event_id: EventId,
        /// The missing shift
        shift_id: ShiftId,
    },

    /// Infrastructure failure in the backing store (connection drop, I/O, poisoned lock).
    #[error("{operation} operation failed")]
    StoreFailure {
        /// Operation that failed
        operation: Operation,
    },

    /// An increment would push the counter past `u32::MAX`.
    #[error("counter {key} would overflow")]
    CounterOverflow {
        /// The counter being incremented
        key: CounterKey,
    },
}

/// Convenience alias for collaborator results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the reservation service.
///
/// # Error Handling Strategy
///
/// - **NotFound**: not retryable; show a validation error to the user
/// - **TransientStore**: retry with backoff; never treat as "capacity available"
/// - **DeadlineExceeded**: the caller's deadline fired before this item resolved; retryable
/// - **CapacityExceeded**: only from `reserve`; ask the user to reduce the quantity
/// - **CounterOverflow**: the count no longer fits a `u32`; needs an operator, not a retry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// Unknown event or shift.
    #[error("{}", not_found_message(event_id, shift_id.as_ref()))]
    NotFound {
        /// The event that was looked up
        event_id: EventId,
        /// The shift that was looked up, when the event itself exists
        shift_id: Option<ShiftId>,
    },

    /// A counter or catalog call failed for infrastructure reasons.
    #[error("transient store error during {operation}")]
    TransientStore {
        /// Operation that failed
        operation: Operation,
    },

    /// The batch deadline elapsed before this check completed.
    #[error("capacity check for {key} did not complete before the deadline")]
    DeadlineExceeded {
        /// Counter whose check was still pending
        key: CounterKey,
    },

    /// A capacity-bounded reservation was refused.
    #[error("shift {key} has {available} place(s) left, {requested} requested")]
    CapacityExceeded {
        /// Counter that refused the reservation
        key: CounterKey,
        /// Quantity requested
        requested: u32,
        /// Places left at the moment of refusal
        available: u32,
    },

    /// A counter would exceed `u32::MAX`. Retrying cannot succeed.
    #[error("counter {key} would overflow")]
    CounterOverflow {
        /// The counter that overflowed
        key: CounterKey,
    },
}

fn not_found_message(event_id: &EventId, shift_id: Option<&ShiftId>) -> String {
    match shift_id {
        Some(shift_id) => format!("shift {shift_id} not found in event {event_id}"),
        None => format!("event {event_id} not found"),
    }
}

impl ReservationError {
    /// Whether a caller may retry the same request with backoff.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStore { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

impl From<StoreError> for ReservationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::EventNotFound { event_id } => Self::NotFound {
                event_id,
                shift_id: None,
            },
            StoreError::ShiftNotFound { event_id, shift_id } => Self::NotFound {
                event_id,
                shift_id: Some(shift_id),
            },
            StoreError::StoreFailure { operation } => Self::TransientStore { operation },
            StoreError::CounterOverflow { key } => Self::CounterOverflow { key },
        }
    }
}

/// Convenience alias for service results.
pub type ReservationResult<T> = Result<T, ReservationError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn event_id() -> EventId {
        EventId::try_new("spring-fair").unwrap()
    }

    fn shift_id() -> ShiftId {
        ShiftId::try_new("morning").unwrap()
    }

    #[test]
    fn shift_not_found_maps_to_not_found_with_shift() {
        let error = ReservationError::from(StoreError::ShiftNotFound {
            event_id: event_id(),
            shift_id: shift_id(),
        });

        assert_eq!(
            error,
            ReservationError::NotFound {
                event_id: event_id(),
                shift_id: Some(shift_id()),
            }
        );
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "shift morning not found in event spring-fair");
    }

    #[test]
    fn store_failure_maps_to_retryable_transient_error() {
        let error = ReservationError::from(StoreError::StoreFailure {
            operation: Operation::ReadCounter,
        });

        assert_eq!(
            error,
            ReservationError::TransientStore {
                operation: Operation::ReadCounter
            }
        );
        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "transient store error during read_counter");
    }

    #[test]
    fn deadline_exceeded_is_retryable_and_capacity_exceeded_is_not() {
        let key = CounterKey::new(event_id(), shift_id());

        assert!(ReservationError::DeadlineExceeded { key: key.clone() }.is_retryable());
        assert!(!ReservationError::CapacityExceeded {
            key,
            requested: 3,
            available: 1,
        }
        .is_retryable());
    }

    #[test]
    fn counter_overflow_keeps_its_key_and_is_not_retryable() {
        let key = CounterKey::new(event_id(), shift_id());

        let error = ReservationError::from(StoreError::CounterOverflow { key: key.clone() });

        assert_eq!(error, ReservationError::CounterOverflow { key });
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "counter spring-fair/morning would overflow");
    }
}
