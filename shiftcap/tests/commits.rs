//! Counter mutations through the service: commit, cancel and reserve.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{event_id, service_with, shift_id, Harness};
use futures::future::join_all;
use proptest::prelude::*;
use shiftcap::{
    invalidation::shift_cache_key, BoundedIncrement, CacheType, CapacityState, CounterKey,
    CounterStore, Delta, ReservationConfig, ReservationError, ReservationService, ShiftCounter,
    StoreResult,
};
use shiftcap_memory::InMemoryCounterStore;
use tokio::sync::Notify;

/// Counter store whose next `get` pauses after reading until released.
#[derive(Default)]
struct GatedCounterStore {
    inner: InMemoryCounterStore,
    armed: AtomicBool,
    read_taken: Notify,
    release: Notify,
}

impl GatedCounterStore {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CounterStore for GatedCounterStore {
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter> {
        let counter = self.inner.get(key).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.read_taken.notify_one();
            self.release.notified().await;
        }
        Ok(counter)
    }

    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        self.inner.increment(key, delta).await
    }

    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        self.inner.decrement(key, delta).await
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement> {
        self.inner.increment_within(key, delta, max_capacity).await
    }

    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()> {
        self.inner.reconcile(key, actual_count).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_commits_lose_no_updates() {
    // Given: a fresh counter
    let harness = Harness::new();
    let (fair, morning) = (event_id("fair"), shift_id("morning"));
    let quantities: Vec<u32> = (1..=40).map(|i| i % 4 + 1).collect();
    let expected: u32 = quantities.iter().sum();

    // When: every commit runs on its own task
    let tasks: Vec<_> = quantities
        .iter()
        .map(|&quantity| {
            let service = harness.service.clone();
            let (fair, morning) = (fair.clone(), morning.clone());
            tokio::spawn(async move { service.commit(&fair, &morning, quantity).await })
        })
        .collect();
    for joined in join_all(tasks).await {
        joined.expect("commit task").expect("commit");
    }

    // Then: the counter holds the sum of all quantities
    let counter = harness
        .counters
        .get(&CounterKey::new(fair, morning))
        .await
        .unwrap();
    assert_eq!(counter.attendee_count, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_interleaving_of_commits_sums_exactly(quantities in prop::collection::vec(1u32..20, 1..30)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let count = runtime.block_on(async {
            let harness = Harness::new();
            let (fair, morning) = (event_id("fair"), shift_id("morning"));

            join_all(quantities.iter().map(|&quantity| {
                let service = harness.service.clone();
                let (fair, morning) = (fair.clone(), morning.clone());
                async move { service.commit(&fair, &morning, quantity).await }
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

            harness
                .counters
                .get(&CounterKey::new(fair, morning))
                .await
                .unwrap()
                .attendee_count
        });

        prop_assert_eq!(count, quantities.iter().sum::<u32>());
    }
}

#[tokio::test]
async fn zero_quantity_commit_is_a_no_op() {
    let harness = Harness::new();

    harness
        .service
        .commit(&event_id("fair"), &shift_id("morning"), 0)
        .await
        .unwrap();

    assert!(harness.counters.is_empty());
}

#[tokio::test]
async fn commit_invalidates_the_cached_counter() {
    // Given: a warm cache showing 0 attendees
    let harness = Harness::new();
    let (fair, morning) = (event_id("fair"), shift_id("morning"));
    let before = harness.service.check_capacity(&fair, &morning, 1).await.unwrap();
    assert_eq!(before.current_attendees, 0);
    let cache_key = shift_cache_key(&CounterKey::new(fair.clone(), morning.clone()));
    assert!(harness.service.cache().contains(CacheType::Counter, &cache_key));

    // When: a commit lands
    harness.service.commit(&fair, &morning, 3).await.unwrap();

    // Then: the counter entry is gone, the shift entry stays, and the next check sees the commit
    assert!(!harness.service.cache().contains(CacheType::Counter, &cache_key));
    assert!(harness.service.cache().contains(CacheType::Shift, &cache_key));
    let after = harness.service.check_capacity(&fair, &morning, 1).await.unwrap();
    assert_eq!(after.current_attendees, 3);
}

#[tokio::test]
async fn commit_leaves_other_shifts_cached() {
    let harness = Harness::new();
    let fair = event_id("fair");
    harness.service.check_capacity(&fair, &shift_id("noon"), 1).await.unwrap();

    harness.service.commit(&fair, &shift_id("morning"), 1).await.unwrap();

    let noon_key = shift_cache_key(&CounterKey::new(fair, shift_id("noon")));
    assert!(harness.service.cache().contains(CacheType::Counter, &noon_key));
}

#[tokio::test]
async fn cancel_floors_at_zero_and_reopens_a_full_shift() {
    // Given: the 2-place noon shift is full
    let harness = Harness::new();
    let (fair, noon) = (event_id("fair"), shift_id("noon"));
    harness.service.commit(&fair, &noon, 2).await.unwrap();
    let full = harness.service.check_capacity(&fair, &noon, 1).await.unwrap();
    assert_eq!(full.state(5), CapacityState::Full);

    // When: one place is cancelled, then far more than remain
    harness.service.cancel(&fair, &noon, 1).await.unwrap();
    let reopened = harness.service.check_capacity(&fair, &noon, 1).await.unwrap();
    harness.service.cancel(&fair, &noon, 50).await.unwrap();

    // Then: the shift reopened and the counter never went negative
    assert!(reopened.can_book);
    assert_eq!(reopened.available, 1);
    let counter = harness
        .counters
        .get(&CounterKey::new(fair, noon))
        .await
        .unwrap();
    assert_eq!(counter.attendee_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_racing_checkouts_exactly_fill_a_two_place_shift() {
    // Given: the noon shift with capacity 2 and no attendees
    let harness = Harness::new();
    let (fair, noon) = (event_id("fair"), shift_id("noon"));

    // When: two checkouts both check before either commits
    let (first, second) = tokio::join!(
        harness.service.check_capacity(&fair, &noon, 1),
        harness.service.check_capacity(&fair, &noon, 1)
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!((first.available, second.available), (2, 2));
    assert!(first.can_book && second.can_book);

    let (first_commit, second_commit) = tokio::join!(
        harness.service.commit(&fair, &noon, 1),
        harness.service.commit(&fair, &noon, 1)
    );
    first_commit.unwrap();
    second_commit.unwrap();

    // Then: capacity is exactly met and a third checkout is refused
    let counter = harness
        .counters
        .get(&CounterKey::new(fair.clone(), noon.clone()))
        .await
        .unwrap();
    assert_eq!(counter.attendee_count, 2);

    let third = harness.service.check_capacity(&fair, &noon, 1).await.unwrap();
    assert_eq!(third.available, 0);
    assert!(third.is_full);
    assert!(!third.can_book);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reservations_never_overbook() {
    // Given: the noon shift with capacity 2
    let harness = Harness::new();
    let (fair, noon) = (event_id("fair"), shift_id("noon"));

    // When: five checkouts race to reserve one place each
    let outcomes = join_all((0..5).map(|_| {
        let service = harness.service.clone();
        let (fair, noon) = (fair.clone(), noon.clone());
        tokio::spawn(async move { service.reserve(&fair, &noon, 1).await })
    }))
    .await;

    // Then: exactly two succeed and the rest see the shift full
    let mut reserved = 0;
    for outcome in outcomes {
        match outcome.expect("reserve task") {
            Ok(_) => reserved += 1,
            Err(ReservationError::CapacityExceeded {
                requested,
                available,
                ..
            }) => {
                assert_eq!(requested, 1);
                assert_eq!(available, 0);
            }
            Err(other) => panic!("unexpected reserve error: {other}"),
        }
    }
    assert_eq!(reserved, 2);

    let verdict = harness.service.check_capacity(&fair, &noon, 1).await.unwrap();
    assert!(verdict.is_full);
}

#[tokio::test]
async fn reserve_reports_the_shortfall_and_unknown_shifts() {
    let harness = Harness::new();
    let fair = event_id("fair");

    assert_eq!(
        harness.service.reserve(&fair, &shift_id("morning"), 7).await,
        Ok(7)
    );
    assert_eq!(
        harness.service.reserve(&fair, &shift_id("morning"), 4).await,
        Err(ReservationError::CapacityExceeded {
            key: CounterKey::new(fair.clone(), shift_id("morning")),
            requested: 4,
            available: 3,
        })
    );
    assert_eq!(
        harness.service.reserve(&fair, &shift_id("morning"), 0).await,
        Ok(7)
    );
    assert!(matches!(
        harness.service.reserve(&fair, &shift_id("midnight"), 1).await,
        Err(ReservationError::NotFound { .. })
    ));
}

#[tokio::test]
async fn attendance_overview_is_cached_until_a_commit_touches_the_event() {
    // Given: one committed attendee on the morning shift
    let harness = Harness::new();
    let fair = event_id("fair");
    harness.service.commit(&fair, &shift_id("morning"), 1).await.unwrap();

    // When: the overview is built, then a commit lands, then it is read again
    let first = harness.service.attendance_overview(&fair).await.unwrap();
    harness.service.commit(&fair, &shift_id("noon"), 2).await.unwrap();
    let second = harness.service.attendance_overview(&fair).await.unwrap();

    // Then: rows follow catalog order and the second read reflects the commit
    let names: Vec<_> = first.iter().map(|row| row.shift_id.to_string()).collect();
    assert_eq!(names, vec!["morning", "noon", "evening"]);
    assert_eq!(first[0].current_attendees, 1);
    assert!((first[0].utilization_percentage - 10.0).abs() < 1e-9);
    assert_eq!(first[1].current_attendees, 0);

    assert_eq!(second[1].current_attendees, 2);
    assert!(second[1].is_full);
    assert_eq!(second[1].state, CapacityState::Full);
    assert!((second[1].utilization_percentage - 100.0).abs() < 1e-9);
    assert!(second[2].is_full);
    assert!((second[2].utilization_percentage - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn attendance_overview_of_unknown_event_is_not_found() {
    let harness = Harness::new();

    let result = harness.service.attendance_overview(&event_id("gala")).await;

    assert!(matches!(result, Err(ReservationError::NotFound { shift_id: None, .. })));
}

#[tokio::test]
async fn catalog_changes_are_picked_up_after_catalog_changed() {
    // Given: the noon shift is cached with capacity 2
    let harness = Harness::new();
    let (fair, noon) = (event_id("fair"), shift_id("noon"));
    harness.service.check_capacity(&fair, &noon, 1).await.unwrap();

    // When: an admin raises its capacity to 6
    let original = common::fair();
    let shifts: Vec<_> = original
        .shifts()
        .iter()
        .cloned()
        .map(|mut shift| {
            if shift.id == noon {
                shift.max_capacity = 6;
            }
            shift
        })
        .collect();
    let updated = shiftcap::Event::try_new(fair.clone(), original.name(), shifts).unwrap();
    harness.catalog.insert_event(updated).unwrap();
    let stale = harness.service.check_capacity(&fair, &noon, 1).await.unwrap();
    harness.service.catalog_changed(&fair);
    let fresh = harness.service.check_capacity(&fair, &noon, 1).await.unwrap();

    // Then: the cached definition is served until the hook runs
    assert_eq!(stale.max_capacity, 2);
    assert_eq!(fresh.max_capacity, 6);
}

#[tokio::test]
async fn shared_cache_sees_invalidations_from_every_service_instance() {
    let harness = Harness::new();
    let (fair, morning) = (event_id("fair"), shift_id("morning"));
    let other = ReservationService::new(
        harness.counters.clone(),
        harness.catalog.clone(),
        harness.ledger.clone(),
    )
    .with_cache(Arc::clone(harness.service.cache()));

    harness.service.check_capacity(&fair, &morning, 1).await.unwrap();
    other.commit(&fair, &morning, 4).await.unwrap();
    let verdict = harness.service.check_capacity(&fair, &morning, 1).await.unwrap();

    assert_eq!(verdict.current_attendees, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_in_flight_during_a_commit_never_caches_the_old_count() {
    // Given: a capacity check whose counter read returned 0 and is still in flight
    let counters = Arc::new(GatedCounterStore::default());
    let service = service_with(counters.clone(), None, ReservationConfig::default());
    let (fair, noon) = (event_id("fair"), shift_id("noon"));
    counters.arm();
    let in_flight = tokio::spawn({
        let service = service.clone();
        let (fair, noon) = (fair.clone(), noon.clone());
        async move { service.check_capacity(&fair, &noon, 1).await }
    });
    counters.read_taken.notified().await;

    // When: a commit fills the shift, then the old read completes
    service.commit(&fair, &noon, 2).await.unwrap();
    counters.release.notify_one();
    let raced = in_flight.await.expect("check task").unwrap();

    // Then: only the raced read saw 0; the next check sees the commit
    assert_eq!(raced.current_attendees, 0);
    let after = service.check_capacity(&fair, &noon, 1).await.unwrap();
    assert_eq!(after.current_attendees, 2);
    assert!(after.is_full);
    assert!(!after.can_book);
}

#[tokio::test(flavor = "multi_thread")]
async fn overview_built_during_a_commit_is_not_cached() {
    let counters = Arc::new(GatedCounterStore::default());
    let service = service_with(counters.clone(), None, ReservationConfig::default());
    let fair = event_id("fair");
    counters.arm();
    let in_flight = tokio::spawn({
        let service = service.clone();
        let fair = fair.clone();
        async move { service.attendance_overview(&fair).await }
    });
    counters.read_taken.notified().await;

    service.commit(&fair, &shift_id("morning"), 1).await.unwrap();
    counters.release.notify_one();
    in_flight.await.expect("overview task").unwrap();

    let overview = service.attendance_overview(&fair).await.unwrap();
    assert_eq!(overview[0].current_attendees, 1);
}
