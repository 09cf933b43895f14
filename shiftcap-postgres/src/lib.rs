//! PostgreSQL counter store for `shiftcap`.
//!
//! Counters live in a single `shift_counters` table keyed by
//! `(event_id, shift_id)`. Every mutation is one atomic statement (an upsert
//! that adds, subtracts or overwrites in place) except the bounded increment,
//! which takes a row lock inside a short transaction. No mutation reads the
//! count into the application and writes it back.
//!
//! Run [`PostgresCounterStore::migrate`] once at startup to create the table.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nutype::nutype;
use shiftcap::errors::{Operation, StoreError, StoreResult};
use shiftcap::store::{BoundedIncrement, CounterStore};
use shiftcap::types::{CounterKey, Delta, ShiftCounter};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, query_scalar, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Errors raised while setting up the store.
#[derive(Debug, Error)]
pub enum PostgresCounterStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The database did not answer a health check.
    #[error("postgres health check failed")]
    PingFailed(#[source] sqlx::Error),

    /// Schema migrations could not be applied.
    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using `NonZeroU32` as the underlying type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the `PostgresCounterStore` connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// `CounterStore` backed by the `shift_counters` table.
#[derive(Debug, Clone)]
pub struct PostgresCounterStore {
    pool: Pool<Postgres>,
}

impl PostgresCounterStore {
    /// Connects with default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresCounterStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresCounterStoreError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresCounterStoreError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool, e.g. one shared with the order ledger.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Round-trips a trivial query.
    pub async fn ping(&self) -> Result<(), PostgresCounterStoreError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresCounterStoreError::PingFailed)?;
        Ok(())
    }

    /// Creates or upgrades the `shift_counters` table.
    pub async fn migrate(&self) -> Result<(), PostgresCounterStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| {
                error!(%error, operation = %Operation::Migrate, "[postgres.database_error] database operation failed");
                PostgresCounterStoreError::MigrationFailed(error)
            })?;
        info!("[postgres.migrate] shift_counters schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    #[instrument(name = "postgres.get_counter", skip_all, fields(key = %key))]
    async fn get(&self, key: &CounterKey) -> StoreResult<ShiftCounter> {
        let row = query(
            "SELECT attendee_count, last_updated, last_reconciled FROM shift_counters \
             WHERE event_id = $1 AND shift_id = $2",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReadCounter, key))?;

        row.map_or_else(
            || Ok(ShiftCounter::zero(key.clone())),
            |row| counter_from_row(key, &row),
        )
    }

    #[instrument(name = "postgres.increment", skip_all, fields(key = %key, delta = delta.get()))]
    async fn increment(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        let count: i64 = query_scalar(
            "INSERT INTO shift_counters (event_id, shift_id, attendee_count, last_updated) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (event_id, shift_id) DO UPDATE \
             SET attendee_count = shift_counters.attendee_count + EXCLUDED.attendee_count, \
                 last_updated = EXCLUDED.last_updated \
             RETURNING attendee_count",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .bind(i64::from(delta.get()))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::IncrementCounter, key))?;

        count_from_db(count, Operation::IncrementCounter)
    }

    #[instrument(name = "postgres.decrement", skip_all, fields(key = %key, delta = delta.get()))]
    async fn decrement(&self, key: &CounterKey, delta: Delta) -> StoreResult<u32> {
        let count: i64 = query_scalar(
            "INSERT INTO shift_counters (event_id, shift_id, attendee_count, last_updated) \
             VALUES ($1, $2, 0, now()) \
             ON CONFLICT (event_id, shift_id) DO UPDATE \
             SET attendee_count = GREATEST(shift_counters.attendee_count - $3, 0), \
                 last_updated = EXCLUDED.last_updated \
             RETURNING attendee_count",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .bind(i64::from(delta.get()))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::DecrementCounter, key))?;

        count_from_db(count, Operation::DecrementCounter)
    }

    #[instrument(name = "postgres.increment_within", skip_all, fields(key = %key, delta = delta.get()))]
    async fn increment_within(
        &self,
        key: &CounterKey,
        delta: Delta,
        max_capacity: u32,
    ) -> StoreResult<BoundedIncrement> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction, key))?;

        query(
            "INSERT INTO shift_counters (event_id, shift_id) VALUES ($1, $2) \
             ON CONFLICT (event_id, shift_id) DO NOTHING",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .execute(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReserveCounter, key))?;

        // row lock serializes concurrent bounded increments on the key
        let current: i64 = query_scalar(
            "SELECT attendee_count FROM shift_counters \
             WHERE event_id = $1 AND shift_id = $2 FOR UPDATE",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReserveCounter, key))?;
        let current = count_from_db(current, Operation::ReserveCounter)?;

        if u64::from(current) + u64::from(delta.get()) > u64::from(max_capacity) {
            // also discards the placeholder row
            tx.rollback()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction, key))?;
            return Ok(BoundedIncrement::Rejected(current));
        }

        let count: i64 = query_scalar(
            "UPDATE shift_counters \
             SET attendee_count = attendee_count + $3, last_updated = now() \
             WHERE event_id = $1 AND shift_id = $2 \
             RETURNING attendee_count",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .bind(i64::from(delta.get()))
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReserveCounter, key))?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction, key))?;

        count_from_db(count, Operation::ReserveCounter).map(BoundedIncrement::Applied)
    }

    #[instrument(name = "postgres.reconcile", skip_all, fields(key = %key, actual_count = actual_count))]
    async fn reconcile(&self, key: &CounterKey, actual_count: u32) -> StoreResult<()> {
        query(
            "INSERT INTO shift_counters (event_id, shift_id, attendee_count, last_updated, last_reconciled) \
             VALUES ($1, $2, $3, now(), now()) \
             ON CONFLICT (event_id, shift_id) DO UPDATE \
             SET attendee_count = EXCLUDED.attendee_count, \
                 last_updated = EXCLUDED.last_updated, \
                 last_reconciled = EXCLUDED.last_reconciled",
        )
        .bind(key.event_id.as_ref())
        .bind(key.shift_id.as_ref())
        .bind(i64::from(actual_count))
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReconcileCounter, key))?;

        Ok(())
    }
}

fn counter_from_row(key: &CounterKey, row: &PgRow) -> StoreResult<ShiftCounter> {
    let decode = |error: sqlx::Error| map_sqlx_error(error, Operation::ReadCounter, key);

    let count: i64 = row.try_get("attendee_count").map_err(decode)?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated").map_err(decode)?;
    let last_reconciled: Option<DateTime<Utc>> = row.try_get("last_reconciled").map_err(decode)?;

    Ok(ShiftCounter {
        key: key.clone(),
        attendee_count: count_from_db(count, Operation::ReadCounter)?,
        last_updated: last_updated.into(),
        last_reconciled: last_reconciled.map(Into::into),
    })
}

fn count_from_db(count: i64, operation: Operation) -> StoreResult<u32> {
    u32::try_from(count).map_err(|_| {
        error!(
            count,
            operation = %operation,
            "[postgres.invalid_count] stored attendee_count is outside the u32 range"
        );
        StoreError::StoreFailure { operation }
    })
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation, key: &CounterKey) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        // 23514: check_violation, only raised by the u32 upper bound on increment
        if db_error.code().as_deref() == Some("23514") {
            warn!(
                key = %key,
                error = %db_error,
                "[postgres.counter_overflow] increment would exceed the counter range"
            );
            return StoreError::CounterOverflow { key: key.clone() };
        }
    }

    error!(
        key = %key,
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure { operation }
}
