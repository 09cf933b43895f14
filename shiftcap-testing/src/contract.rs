//! Behavioral contract for [`CounterStore`] backends.
//!
//! Each scenario builds a fresh store through `make_store`, works on keys
//! unique to the run (so backends sharing a database can run the suite in
//! parallel) and reports the first broken expectation as a
//! [`ContractTestFailure`]. Use [`counter_store_contract_tests!`] to generate
//! one `#[tokio::test]` per scenario.

use std::fmt;
use std::sync::Arc;

use shiftcap::errors::StoreError;
use shiftcap::store::{BoundedIncrement, CounterStore};
use shiftcap::types::{CounterKey, Delta, EventId, ShiftId};
use uuid::Uuid;

/// Concurrent increments issued by [`test_no_lost_updates`].
pub const CONCURRENT_INCREMENTS: u32 = 64;

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_key(scenario: &'static str, label: &str) -> Result<CounterKey, ContractTestFailure> {
    // unique per run for parallel execution against a shared database
    let event = format!("contract-{scenario}-{}", Uuid::now_v7());
    let event_id = EventId::try_new(event.clone()).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct event id `{event}`: {error}"))
    })?;
    let shift_id = ShiftId::try_new(label).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct shift id `{label}`: {error}"))
    })?;
    Ok(CounterKey::new(event_id, shift_id))
}

fn contract_delta(scenario: &'static str, quantity: u32) -> Result<Delta, ContractTestFailure> {
    Delta::from_quantity(quantity).ok_or_else(|| {
        ContractTestFailure::assertion(scenario, format!("delta {quantity} must be positive"))
    })
}

async fn read_count<S: CounterStore>(
    scenario: &'static str,
    store: &S,
    key: &CounterKey,
) -> Result<u32, ContractTestFailure> {
    store
        .get(key)
        .await
        .map(|counter| counter.attendee_count)
        .map_err(|error| ContractTestFailure::store_error(scenario, "get", &error))
}

fn expect_count(scenario: &'static str, what: &str, expected: u32, observed: u32) -> ContractTestResult {
    if expected == observed {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            scenario,
            format!("{what}: expected count {expected}, observed {observed}"),
        ))
    }
}

/// A counter that was never written reads as zero and is not reconciled.
pub async fn test_missing_counter_reads_zero<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: CounterStore + 'static,
{
    const SCENARIO: &str = "missing_counter_reads_zero";

    let store = make_store();
    let key = contract_key(SCENARIO, "ghost")?;

    let counter = store
        .get(&key)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "get", &error))?;

    expect_count(SCENARIO, "untouched counter", 0, counter.attendee_count)?;
    if counter.key != key {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected counter for {key}, observed {}", counter.key),
        ));
    }
    if counter.last_reconciled.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "untouched counter reports a reconciliation",
        ));
    }
    Ok(())
}

/// Concurrent increments on one key all land.
pub async fn test_no_lost_updates<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: CounterStore + 'static,
{
    const SCENARIO: &str = "no_lost_updates";

    let store = Arc::new(make_store());
    let key = contract_key(SCENARIO, "contended")?;
    let one = contract_delta(SCENARIO, 1)?;

    let tasks: Vec<_> = (0..CONCURRENT_INCREMENTS)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.increment(&key, one).await })
        })
        .collect();

    for joined in futures::future::join_all(tasks).await {
        let result = joined.map_err(|error| {
            ContractTestFailure::assertion(SCENARIO, format!("increment task panicked: {error}"))
        })?;
        let _ = result.map_err(|error| ContractTestFailure::store_error(SCENARIO, "increment", &error))?;
    }

    let count = read_count(SCENARIO, store.as_ref(), &key).await?;
    expect_count(SCENARIO, "after concurrent increments", CONCURRENT_INCREMENTS, count)
}

/// Decrements never take a counter below zero.
pub async fn test_decrement_floors_at_zero<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: CounterStore + 'static,
{
    const SCENARIO: &str = "decrement_floors_at_zero";

    let store = make_store();
    let key = contract_key(SCENARIO, "floor")?;

    let _ = store
        .increment(&key, contract_delta(SCENARIO, 2)?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "increment", &error))?;
    let returned = store
        .decrement(&key, contract_delta(SCENARIO, 5)?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "decrement", &error))?;
    expect_count(SCENARIO, "decrement return value", 0, returned)?;

    let untouched = contract_key(SCENARIO, "never-incremented")?;
    let returned = store
        .decrement(&untouched, contract_delta(SCENARIO, 1)?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "decrement", &error))?;
    expect_count(SCENARIO, "decrement of missing counter", 0, returned)?;

    let count = read_count(SCENARIO, &store, &key).await?;
    expect_count(SCENARIO, "after over-decrement", 0, count)
}

/// Reconciliation overwrites the count and records when it happened.
pub async fn test_reconcile_overwrites<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: CounterStore + 'static,
{
    const SCENARIO: &str = "reconcile_overwrites";

    let store = make_store();
    let key = contract_key(SCENARIO, "drifted")?;

    let _ = store
        .increment(&key, contract_delta(SCENARIO, 7)?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "increment", &error))?;

    for _ in 0..2 {
        store
            .reconcile(&key, 3)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "reconcile", &error))?;
    }

    let counter = store
        .get(&key)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "get", &error))?;
    expect_count(SCENARIO, "after reconcile", 3, counter.attendee_count)?;
    if counter.last_reconciled.is_none() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "reconciled counter has no last_reconciled timestamp",
        ));
    }

    let absent = contract_key(SCENARIO, "absent")?;
    store
        .reconcile(&absent, 4)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "reconcile", &error))?;
    let count = read_count(SCENARIO, &store, &absent).await?;
    expect_count(SCENARIO, "reconcile of missing counter", 4, count)
}

/// Bounded increments never exceed the bound, even under contention.
pub async fn test_increment_within_respects_capacity<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: CounterStore + 'static,
{
    const SCENARIO: &str = "increment_within_respects_capacity";
    const CAPACITY: u32 = 10;

    let store = Arc::new(make_store());
    let key = contract_key(SCENARIO, "bounded")?;
    let one = contract_delta(SCENARIO, 1)?;

    let tasks: Vec<_> = (0..CAPACITY * 3)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.increment_within(&key, one, CAPACITY).await })
        })
        .collect();

    let mut applied = 0;
    for joined in futures::future::join_all(tasks).await {
        let outcome = joined
            .map_err(|error| {
                ContractTestFailure::assertion(SCENARIO, format!("reserve task panicked: {error}"))
            })?
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "increment_within", &error))?;
        match outcome {
            BoundedIncrement::Applied(count) if count > CAPACITY => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("applied increment reported count {count} above capacity {CAPACITY}"),
                ));
            }
            BoundedIncrement::Applied(_) => applied += 1,
            BoundedIncrement::Rejected(_) => {}
        }
    }

    expect_count(SCENARIO, "applied bounded increments", CAPACITY, applied)?;
    let count = read_count(SCENARIO, store.as_ref(), &key).await?;
    expect_count(SCENARIO, "after bounded increments", CAPACITY, count)?;

    match store
        .increment_within(&key, contract_delta(SCENARIO, 1)?, CAPACITY)
        .await
    {
        Ok(BoundedIncrement::Rejected(current)) => {
            expect_count(SCENARIO, "rejected increment current count", CAPACITY, current)
        }
        Ok(BoundedIncrement::Applied(count)) => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("increment on a full counter was applied (count {count})"),
        )),
        Err(error) => Err(ContractTestFailure::store_error(SCENARIO, "increment_within", &error)),
    }
}

/// Mutating one counter leaves every other counter alone.
pub async fn test_key_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: CounterStore + 'static,
{
    const SCENARIO: &str = "key_isolation";

    let store = make_store();
    let left = contract_key(SCENARIO, "left")?;
    let right = CounterKey::new(left.event_id.clone(), ShiftId::try_new("right").map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("unable to construct shift id: {error}"))
    })?);

    let _ = store
        .increment(&left, contract_delta(SCENARIO, 5)?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "increment", &error))?;
    let _ = store
        .increment(&right, contract_delta(SCENARIO, 2)?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "increment", &error))?;
    store
        .reconcile(&left, 1)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "reconcile", &error))?;

    expect_count(SCENARIO, "left counter", 1, read_count(SCENARIO, &store, &left).await?)?;
    expect_count(SCENARIO, "right counter", 2, read_count(SCENARIO, &store, &right).await?)
}

/// Generates one test per contract scenario for a counter store.
///
/// ```rust,ignore
/// use shiftcap_testing::contract::counter_store_contract_tests;
///
/// counter_store_contract_tests! {
///     suite = in_memory,
///     make_store = shiftcap_memory::InMemoryCounterStore::new,
/// }
/// ```
#[macro_export]
macro_rules! counter_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_decrement_floors_at_zero, test_increment_within_respects_capacity,
                test_key_isolation, test_missing_counter_reads_zero, test_no_lost_updates,
                test_reconcile_overwrites,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_counter_reads_zero_contract() {
                test_missing_counter_reads_zero($make_store)
                    .await
                    .expect("counter store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn no_lost_updates_contract() {
                test_no_lost_updates($make_store)
                    .await
                    .expect("counter store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn decrement_floors_at_zero_contract() {
                test_decrement_floors_at_zero($make_store)
                    .await
                    .expect("counter store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn reconcile_overwrites_contract() {
                test_reconcile_overwrites($make_store)
                    .await
                    .expect("counter store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn increment_within_respects_capacity_contract() {
                test_increment_within_respects_capacity($make_store)
                    .await
                    .expect("counter store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn key_isolation_contract() {
                test_key_isolation($make_store)
                    .await
                    .expect("counter store contract failed");
            }
        }
    };
}

pub use counter_store_contract_tests;
