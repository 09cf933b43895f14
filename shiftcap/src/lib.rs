//! `shiftcap` - shift-capacity reservation for checkout flows
//!
//! Many concurrent shoppers reserve places in limited-capacity shifts. This
//! crate keeps per-shift attendee counters race-free, answers capacity
//! questions with as few store round trips as possible, and lets the checkout
//! flow validate a whole cart at once.
//!
//! # Components
//!
//! - [`store`]: the counter store, shift catalog and order ledger contracts
//! - [`evaluator`]: pure capacity math
//! - [`service`]: single and batch checks, commits, reconciliation, overview
//! - [`cache`] and [`invalidation`]: read-through cache and its invalidation table
//! - [`checkout`]: cart grouping, cart validation and live availability
//! - [`dispatcher`] and [`reconciler`]: background commits and periodic reconciliation
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shiftcap::{CheckoutClient, ReservationService};
//! use shiftcap_memory::{InMemoryCatalog, InMemoryCounterStore, InMemoryOrderLedger};
//!
//! let service = ReservationService::new(
//!     Arc::new(InMemoryCounterStore::new()),
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(InMemoryOrderLedger::new()),
//! );
//! let checkout = CheckoutClient::new(service.clone());
//!
//! let validation = checkout.validate_cart(&event_id, &cart).await;
//! if validation.success {
//!     // take payment, record the order, then:
//!     service.commit(&event_id, &shift_id, quantity).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod checkout;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod evaluator;
pub mod invalidation;
pub mod reconciler;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;

pub use cache::{CacheStats, CacheType, ReadThroughCache};
pub use checkout::{
    group_by_shift, CartItem, CartValidation, CheckoutClient, LiveAvailability, ShiftShortfall,
};
pub use config::{AlmostFullThreshold, DriftThreshold, ReservationConfig};
pub use dispatcher::{CommitDispatcher, CommitHandle, CommitRequest, DispatchStats, DispatcherClosed};
pub use errors::{Operation, ReservationError, ReservationResult, StoreError, StoreResult};
pub use evaluator::{evaluate, CapacityState, CapacityVerdict};
pub use invalidation::{Invalidation, Mutation};
pub use reconciler::{ReconciliationJob, ReconciliationStats};
pub use retry::RetryConfig;
pub use service::{
    BatchCapacityReport, BatchSummary, CapacityCheck, CapacityRequest, ReconciliationReport,
    ReservationService, ShiftAttendance,
};
pub use store::{BoundedIncrement, CounterStore, OrderLedger, ShiftCatalog};
pub use types::{
    CounterKey, Delta, Event, EventDefinitionError, EventId, LedgerLineItem, OrderId, ProductId,
    Shift, ShiftCounter, ShiftId, Timestamp,
};
