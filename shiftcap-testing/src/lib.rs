//! Test support for `shiftcap` backends and services.
//!
//! - [`contract`]: behavioral suite every [`shiftcap::CounterStore`] must pass
//! - [`chaos`]: wrappers injecting failures and latency into collaborators
//! - [`instrumented`]: wrappers counting collaborator calls

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod contract;
pub mod instrumented;

pub use chaos::{ChaosCatalog, ChaosConfig, ChaosCounterStore, Probability};
pub use instrumented::{CallCounts, CountingCatalog, CountingCounterStore};
