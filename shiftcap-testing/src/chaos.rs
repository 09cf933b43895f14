//! Failure and latency injection for collaborators.
//!
//! [`ChaosCounterStore`] and [`ChaosCatalog`] wrap a real collaborator and,
//! per call, either delegate or return `StoreError::StoreFailure`. Failures
//! can be random ([`ChaosConfig::with_failure_probability`]), scripted
//! ([`ChaosCounterStore::fail_next`]) or both. An optional fixed latency is
//! applied before every call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nutype::nutype;
use rand::rngs::StdRng;
use rand::{random, Rng, SeedableRng};
use shiftcap::errors::{Operation, StoreError, StoreResult};
use shiftcap::store::{BoundedIncrement, CounterStore, ShiftCatalog};
use shiftcap::types::{CounterKey, Delta, EventId, Shift, ShiftCounter, ShiftId};
use tracing::debug;

/// Probability value for chaos injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// ```
/// use shiftcap_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// assert!(Probability::try_new(-0.1).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        Self::try_new(value.clamp(0.0, 1.0)).unwrap_or_else(|_| Self::never())
    }

    fn never() -> Self {
        // 0.0 is inside the validated range
        Self::try_new(0.0).unwrap_or_else(|_| unreachable!())
    }
}

/// How a chaos wrapper misbehaves.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    latency: Option<Duration>,
}

impl ChaosConfig {
    /// A configuration with a fixed RNG seed, for reproducible runs.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Fails each call with the given probability, clamped to [0.0, 1.0].
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Delays every call by `latency` before delegating.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::never(),
            latency: None,
        }
    }
}

#[derive(Debug)]
struct Injector {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    scripted_failures: AtomicU32,
}

impl Injector {
    fn new(config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            config,
            rng: Mutex::new(rng),
            scripted_failures: AtomicU32::new(0),
        }
    }

    fn take_scripted_failure(&self) -> bool {
        self.scripted_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn should_inject(&self) -> bool {
        if self.take_scripted_failure() {
            return true;
        }

        let probability: f32 = self.config.failure_probability.into();
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.random_bool(f64::from(probability))
    }

    async fn before_call(&self, operation: Operation) -> StoreResult<()> {
        if let Some(latency) = self.config.latency {
            tokio::time::sleep(latency).await;
        }

        if self.should_inject() {
            debug!(%operation, "[chaos.injected_failure] injecting store failure");
            return Err(StoreError::StoreFailure { operation });
        }
        Ok(())
    }
}

/// Counter store wrapper injecting failures and latency.
#[derive(Debug)]
pub struct ChaosCounterStore<S> {
    store: S,
    injector: Injector,
}

impl<S> ChaosCounterStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        Self {
            store,
            injector: Injector::new(config),
        }
    }

    /// Makes the next `calls` calls fail regardless of probability.
    pub fn fail_next(&self, calls: u32) {
        self.injector.scripted_failures.store(calls, Ordering::SeqCst);
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for ChaosCounterStore<S> {
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter> {
        self.injector.before_call(Operation::ReadCounter).await?;
        self.store.get(key).await
    }

    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        self.injector.before_call(Operation::IncrementCounter).await?;
        self.store.increment(key, delta).await
    }

    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        self.injector.before_call(Operation::DecrementCounter).await?;
        self.store.decrement(key, delta).await
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement> {
        self.injector.before_call(Operation::ReserveCounter).await?;
        self.store.increment_within(key, delta, max_capacity).await
    }

    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()> {
        self.injector.before_call(Operation::ReconcileCounter).await?;
        self.store.reconcile(key, actual_count).await
    }
}

/// Shift catalog wrapper injecting failures and latency.
#[derive(Debug)]
pub struct ChaosCatalog<C> {
    catalog: C,
    injector: Injector,
}

impl<C> ChaosCatalog<C> {
    /// Wraps `catalog`.
    pub fn new(catalog: C, config: ChaosConfig) -> Self {
        Self {
            catalog,
            injector: Injector::new(config),
        }
    }

    /// Makes the next `calls` calls fail regardless of probability.
    pub fn fail_next(&self, calls: u32) {
        self.injector.scripted_failures.store(calls, Ordering::SeqCst);
    }
}

#[async_trait]
impl<C: ShiftCatalog> ShiftCatalog for ChaosCatalog<C> {
    async fn get_shift(&self, event_id: &EventId, shift_id: &ShiftId) -> StoreResult<Shift> {
        self.injector.before_call(Operation::ReadShift).await?;
        self.catalog.get_shift(event_id, shift_id).await
    }

    async fn get_all_shifts(&self, event_id: &EventId) -> StoreResult<Vec<Shift>> {
        self.injector.before_call(Operation::ReadShifts).await?;
        self.catalog.get_all_shifts(event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftcap_memory::InMemoryCounterStore;

    fn key() -> CounterKey {
        CounterKey::new(
            EventId::try_new("fair").unwrap(),
            ShiftId::try_new("morning").unwrap(),
        )
    }

    #[test]
    fn deterministic_config_sets_seed() {
        assert!(ChaosConfig::default().deterministic_seed.is_none());
        assert!(ChaosConfig::deterministic().deterministic_seed.is_some());
    }

    #[test]
    fn failure_probability_is_clamped() {
        let config = ChaosConfig::default().with_failure_probability(7.0);
        assert!((f32::from(config.failure_probability) - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn zero_probability_passes_calls_through() {
        let store = ChaosCounterStore::new(InMemoryCounterStore::new(), ChaosConfig::default());

        let count = store
            .increment(&key(), Delta::from_quantity(2).unwrap())
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(store.get(&key()).await.unwrap().attendee_count, 2);
    }

    #[tokio::test]
    async fn certain_failure_reports_the_operation() {
        let store = ChaosCounterStore::new(
            InMemoryCounterStore::new(),
            ChaosConfig::deterministic().with_failure_probability(1.0),
        );

        let result = store.increment(&key(), Delta::from_quantity(1).unwrap()).await;

        assert_eq!(
            result,
            Err(StoreError::StoreFailure {
                operation: Operation::IncrementCounter
            })
        );
        assert!(store.inner().is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let store = ChaosCounterStore::new(InMemoryCounterStore::new(), ChaosConfig::default());
        store.fail_next(2);

        assert!(store.get(&key()).await.is_err());
        assert!(store.get(&key()).await.is_err());
        assert!(store.get(&key()).await.is_ok());
    }
}
