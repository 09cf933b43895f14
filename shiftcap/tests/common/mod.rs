//! Shared fixtures for shiftcap integration tests.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use shiftcap::{
    CounterStore, Event, EventId, OrderLedger, ReservationConfig, ReservationService, Shift,
    ShiftCatalog, ShiftId,
};
use shiftcap_memory::{InMemoryCatalog, InMemoryCounterStore, InMemoryOrderLedger};

pub fn event_id(raw: &str) -> EventId {
    EventId::try_new(raw).expect("valid event id")
}

pub fn shift_id(raw: &str) -> ShiftId {
    ShiftId::try_new(raw).expect("valid shift id")
}

/// A two-hour shift starting at a fixed instant, offset by `hour`.
pub fn shift(id: &str, hour: i64, max_capacity: u32) -> Shift {
    let start = Utc
        .with_ymd_and_hms(2026, 7, 4, 9, 0, 0)
        .single()
        .expect("valid start time")
        + Duration::hours(hour);
    Shift {
        id: shift_id(id),
        name: format!("Shift {id}"),
        start_time: start.into(),
        end_time: (start + Duration::hours(2)).into(),
        max_capacity,
    }
}

/// The "fair" event: morning (10 places), noon (2 places), evening (0 places).
pub fn fair() -> Event {
    Event::try_new(
        event_id("fair"),
        "Summer fair",
        vec![
            shift("morning", 0, 10),
            shift("noon", 3, 2),
            shift("evening", 8, 0),
        ],
    )
    .expect("distinct shift ids")
}

/// Service over in-memory collaborators, with handles to each of them.
pub struct Harness {
    pub service: ReservationService,
    pub counters: Arc<InMemoryCounterStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub ledger: Arc<InMemoryOrderLedger>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ReservationConfig::default())
    }

    pub fn with_config(config: ReservationConfig) -> Self {
        let counters = Arc::new(InMemoryCounterStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let ledger = Arc::new(InMemoryOrderLedger::new());
        catalog.insert_event(fair()).expect("catalog insert");

        let service = ReservationService::new(counters.clone(), catalog.clone(), ledger.clone())
            .with_config(config);

        Self {
            service,
            counters,
            catalog,
            ledger,
        }
    }
}

/// Service over arbitrary collaborators, with the fair event in an in-memory catalog
/// unless a catalog is supplied.
pub fn service_with(
    counters: Arc<dyn CounterStore>,
    catalog: Option<Arc<dyn ShiftCatalog>>,
    config: ReservationConfig,
) -> ReservationService {
    let catalog = catalog.unwrap_or_else(|| {
        let catalog = InMemoryCatalog::new();
        catalog.insert_event(fair()).expect("catalog insert");
        Arc::new(catalog)
    });
    let ledger: Arc<dyn OrderLedger> = Arc::new(InMemoryOrderLedger::new());
    ReservationService::new(counters, catalog, ledger).with_config(config)
}

/// A catalog holding the fair event.
pub fn fair_catalog() -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    catalog.insert_event(fair()).expect("catalog insert");
    catalog
}
