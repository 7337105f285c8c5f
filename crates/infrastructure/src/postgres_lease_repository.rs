//! PostgreSQL-backed lease arbitration state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use flowlease_application::{EventInfo, LeaseStateRepository, LeaseValidity, RowSnapshot};
use flowlease_core::{AppError, AppResult};
use flowlease_domain::{
    ActionKey, LeaseParams, MAX_FLOW_GROUP_LENGTH, MAX_FLOW_NAME_LENGTH, MAX_JOB_NAME_LENGTH,
};

/// Settings for the lease arbitration tables.
///
/// Table names are configurable so that multiple deployments sharing one
/// database never collide; they are restricted to plain identifiers because
/// they are interpolated into statement text, not bound.
#[derive(Debug, Clone)]
pub struct PostgresLeaseArbiterConfig {
    /// Name of the lease table.
    pub lease_table: String,
    /// Name of the shared constants table.
    pub constants_table: String,
    /// Consolidation window: events within this horizon are the same event.
    pub epsilon_millis: i64,
    /// Lease validity duration. Must dwarf epsilon and cover cross-host
    /// round trips including retries.
    pub linger_millis: i64,
    /// Row retention horizon for the sweeper. Must dwarf linger.
    pub retention_millis: i64,
}

impl PostgresLeaseArbiterConfig {
    /// Validates identifier safety and the epsilon ≪ linger ≪ retention
    /// ordering.
    pub fn validate(&self) -> AppResult<()> {
        ensure_sql_identifier(self.lease_table.as_str(), "lease table name")?;
        ensure_sql_identifier(self.constants_table.as_str(), "constants table name")?;

        if self.epsilon_millis <= 0 {
            return Err(AppError::Validation(
                "epsilon_millis must be greater than zero".to_owned(),
            ));
        }
        if self.linger_millis <= self.epsilon_millis {
            return Err(AppError::Validation(
                "linger_millis must be greater than epsilon_millis".to_owned(),
            ));
        }
        if self.retention_millis <= self.linger_millis {
            return Err(AppError::Validation(
                "retention_millis must be greater than linger_millis".to_owned(),
            ));
        }

        Ok(())
    }
}

fn ensure_sql_identifier(value: &str, what: &str) -> AppResult<()> {
    let mut chars = value.chars();
    let first_is_valid = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    let rest_is_valid = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');

    if !(first_is_valid && rest_is_valid) {
        return Err(AppError::Validation(format!(
            "{what} '{value}' is not a plain SQL identifier"
        )));
    }

    Ok(())
}

const KEY_PREDICATE: &str =
    "flow_group = $1 AND flow_name = $2 AND job_name = $3 AND action_type = $4";

/// Statement text is fixed per configured table names, so it is rendered once
/// at construction.
#[derive(Debug)]
struct Statements {
    create_lease_table: String,
    create_constants_table: String,
    upsert_constants: String,
    find_event_info: String,
    find_event_info_for_reminder: String,
    insert_new_lease: String,
    reacquire_expired_lease: String,
    reacquire_finished_lease: String,
    find_row_snapshot: String,
    clear_lease: String,
    delete_past_retention: String,
}

impl Statements {
    fn render(lease_table: &str, constants_table: &str) -> Self {
        // Millisecond precision matters for the epsilon comparison, hence
        // TIMESTAMPTZ(3); storage is UTC either way.
        let create_lease_table = format!(
            "CREATE TABLE IF NOT EXISTS {lease_table} (\n\
             flow_group VARCHAR({MAX_FLOW_GROUP_LENGTH}) NOT NULL,\n\
             flow_name VARCHAR({MAX_FLOW_NAME_LENGTH}) NOT NULL,\n\
             job_name VARCHAR({MAX_JOB_NAME_LENGTH}) NOT NULL,\n\
             action_type VARCHAR(100) NOT NULL,\n\
             event_timestamp TIMESTAMPTZ(3) NOT NULL,\n\
             lease_acquisition_timestamp TIMESTAMPTZ(3),\n\
             PRIMARY KEY (flow_group, flow_name, job_name, action_type))"
        );

        let create_constants_table = format!(
            "CREATE TABLE IF NOT EXISTS {constants_table} (\n\
             primary_key INT NOT NULL,\n\
             epsilon BIGINT NOT NULL,\n\
             linger BIGINT NOT NULL,\n\
             PRIMARY KEY (primary_key))"
        );

        let upsert_constants = format!(
            "INSERT INTO {constants_table} (primary_key, epsilon, linger) VALUES (1, $1, $2) \
             ON CONFLICT (primary_key) \
             DO UPDATE SET epsilon = EXCLUDED.epsilon, linger = EXCLUDED.linger"
        );

        // Cross join against the single constants row so epsilon and linger
        // arrive with the lease state in one round trip. Status codes: 1 the
        // lease is still valid, 2 it expired, 3 the acquisition timestamp is
        // cleared (no longer leasing).
        let validity_projection = "CASE \
             WHEN now() < l.lease_acquisition_timestamp \
                 + make_interval(secs => (l_c.linger::float8 / 1000.0)) THEN 1 \
             WHEN now() >= l.lease_acquisition_timestamp \
                 + make_interval(secs => (l_c.linger::float8 / 1000.0)) THEN 2 \
             ELSE 3 END AS lease_validity_status";

        let find_event_info = format!(
            "SELECT \
             l.event_timestamp AS event_timestamp, \
             l.lease_acquisition_timestamp AS lease_acquisition_timestamp, \
             (ABS(EXTRACT(EPOCH FROM (now() - l.event_timestamp)) * 1000.0) <= l_c.epsilon) \
                 AS is_within_epsilon, \
             {validity_projection}, \
             l_c.linger AS linger, \
             now() AS db_current_timestamp \
             FROM {lease_table} l, {constants_table} l_c \
             WHERE {KEY_PREDICATE}"
        );

        // A reminder consolidates when its event time is not newer than the
        // stored one by more than epsilon; one-sided on purpose, since a
        // reminder older than the stored event exits arbitration earlier.
        let find_event_info_for_reminder = format!(
            "SELECT \
             l.event_timestamp AS event_timestamp, \
             l.lease_acquisition_timestamp AS lease_acquisition_timestamp, \
             (EXTRACT(EPOCH FROM ($5::timestamptz - l.event_timestamp)) * 1000.0 <= l_c.epsilon) \
                 AS is_within_epsilon, \
             {validity_projection}, \
             l_c.linger AS linger, \
             now() AS db_current_timestamp \
             FROM {lease_table} l, {constants_table} l_c \
             WHERE {KEY_PREDICATE}"
        );

        // A lost insert race lands on the primary key conflict and reports
        // zero rows affected.
        let insert_new_lease = format!(
            "INSERT INTO {lease_table} \
             (flow_group, flow_name, job_name, action_type, event_timestamp, \
              lease_acquisition_timestamp) \
             VALUES ($1, $2, $3, $4, now(), now()) \
             ON CONFLICT (flow_group, flow_name, job_name, action_type) DO NOTHING"
        );

        let reacquire_expired_lease = format!(
            "UPDATE {lease_table} \
             SET event_timestamp = now(), lease_acquisition_timestamp = now() \
             WHERE {KEY_PREDICATE} \
             AND event_timestamp = $5 AND lease_acquisition_timestamp = $6"
        );

        let reacquire_finished_lease = format!(
            "UPDATE {lease_table} \
             SET event_timestamp = now(), lease_acquisition_timestamp = now() \
             WHERE {KEY_PREDICATE} \
             AND event_timestamp = $5 AND lease_acquisition_timestamp IS NULL"
        );

        let find_row_snapshot = format!(
            "SELECT \
             l.event_timestamp AS event_timestamp, \
             l.lease_acquisition_timestamp AS lease_acquisition_timestamp, \
             l_c.linger AS linger \
             FROM {lease_table} l, {constants_table} l_c \
             WHERE {KEY_PREDICATE}"
        );

        // event_timestamp is explicitly re-assigned so the write never bumps
        // it.
        let clear_lease = format!(
            "UPDATE {lease_table} \
             SET event_timestamp = event_timestamp, lease_acquisition_timestamp = NULL \
             WHERE {KEY_PREDICATE} \
             AND event_timestamp = $5 AND lease_acquisition_timestamp = $6"
        );

        let delete_past_retention = format!(
            "DELETE FROM {lease_table} \
             WHERE event_timestamp < now() - make_interval(secs => $1::float8)"
        );

        Self {
            create_lease_table,
            create_constants_table,
            upsert_constants,
            find_event_info,
            find_event_info_for_reminder,
            insert_new_lease,
            reacquire_expired_lease,
            reacquire_finished_lease,
            find_row_snapshot,
            clear_lease,
            delete_past_retention,
        }
    }
}

/// PostgreSQL implementation of the lease arbitration state port.
///
/// Every operation is one auto-committed statement on a pooled connection;
/// timestamps are only ever written from the store's `now()`.
#[derive(Debug)]
pub struct PostgresLeaseRepository {
    pool: PgPool,
    config: PostgresLeaseArbiterConfig,
    statements: Statements,
}

impl PostgresLeaseRepository {
    /// Creates a repository over the provided pool after validating the
    /// configuration.
    pub fn new(pool: PgPool, config: PostgresLeaseArbiterConfig) -> AppResult<Self> {
        config.validate()?;
        let statements = Statements::render(
            config.lease_table.as_str(),
            config.constants_table.as_str(),
        );

        Ok(Self {
            pool,
            config,
            statements,
        })
    }

    /// Creates both tables when missing and upserts the constants row, so
    /// concurrent participant startups converge on the configured values.
    pub async fn bootstrap(&self) -> AppResult<()> {
        sqlx::query(self.statements.create_lease_table.as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to create lease table", &error))?;

        sqlx::query(self.statements.create_constants_table.as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to create constants table", &error))?;

        sqlx::query(self.statements.upsert_constants.as_str())
            .bind(self.config.epsilon_millis)
            .bind(self.config.linger_millis)
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to upsert arbitration constants", &error))?;

        info!(
            lease_table = %self.config.lease_table,
            constants_table = %self.config.constants_table,
            epsilon_millis = self.config.epsilon_millis,
            linger_millis = self.config.linger_millis,
            "lease arbitration tables ready"
        );
        Ok(())
    }
}

#[async_trait]
impl LeaseStateRepository for PostgresLeaseRepository {
    async fn find_event_info(&self, params: &LeaseParams) -> AppResult<Option<EventInfo>> {
        let action = params.action();
        let statement = if params.is_reminder() {
            self.statements.find_event_info_for_reminder.as_str()
        } else {
            self.statements.find_event_info.as_str()
        };

        let mut query = sqlx::query_as::<_, EventInfoRow>(statement)
            .bind(action.flow_group())
            .bind(action.flow_name())
            .bind(action.job_name())
            .bind(action.action_type().as_str());
        if params.is_reminder() {
            query = query.bind(timestamp_from_millis(params.event_time_millis())?);
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to read lease event info", &error))?;

        row.map(EventInfoRow::into_event_info).transpose()
    }

    async fn insert_new_lease(&self, action: &ActionKey) -> AppResult<u64> {
        let result = sqlx::query(self.statements.insert_new_lease.as_str())
            .bind(action.flow_group())
            .bind(action.flow_name())
            .bind(action.job_name())
            .bind(action.action_type().as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to insert lease row", &error))?;

        Ok(result.rows_affected())
    }

    async fn reacquire_expired_lease(
        &self,
        action: &ActionKey,
        expected_event_millis: i64,
        expected_lease_millis: i64,
    ) -> AppResult<u64> {
        let result = sqlx::query(self.statements.reacquire_expired_lease.as_str())
            .bind(action.flow_group())
            .bind(action.flow_name())
            .bind(action.job_name())
            .bind(action.action_type().as_str())
            .bind(timestamp_from_millis(expected_event_millis)?)
            .bind(timestamp_from_millis(expected_lease_millis)?)
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to re-acquire expired lease", &error))?;

        Ok(result.rows_affected())
    }

    async fn reacquire_finished_lease(
        &self,
        action: &ActionKey,
        expected_event_millis: i64,
    ) -> AppResult<u64> {
        let result = sqlx::query(self.statements.reacquire_finished_lease.as_str())
            .bind(action.flow_group())
            .bind(action.flow_name())
            .bind(action.job_name())
            .bind(action.action_type().as_str())
            .bind(timestamp_from_millis(expected_event_millis)?)
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to claim finished lease", &error))?;

        Ok(result.rows_affected())
    }

    async fn find_row_snapshot(&self, action: &ActionKey) -> AppResult<Option<RowSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(self.statements.find_row_snapshot.as_str())
            .bind(action.flow_group())
            .bind(action.flow_name())
            .bind(action.job_name())
            .bind(action.action_type().as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to re-select lease row", &error))?;

        row.map(SnapshotRow::into_row_snapshot).transpose()
    }

    async fn clear_lease(
        &self,
        action: &ActionKey,
        event_time_millis: i64,
        lease_acquisition_millis: i64,
    ) -> AppResult<u64> {
        let result = sqlx::query(self.statements.clear_lease.as_str())
            .bind(action.flow_group())
            .bind(action.flow_name())
            .bind(action.job_name())
            .bind(action.action_type().as_str())
            .bind(timestamp_from_millis(event_time_millis)?)
            .bind(timestamp_from_millis(lease_acquisition_millis)?)
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to clear completed lease", &error))?;

        Ok(result.rows_affected())
    }

    async fn delete_rows_past_retention(&self) -> AppResult<u64> {
        let retention_seconds = self.config.retention_millis as f64 / 1000.0;
        let result = sqlx::query(self.statements.delete_past_retention.as_str())
            .bind(retention_seconds)
            .execute(&self.pool)
            .await
            .map_err(|error| map_store_error("failed to sweep lease rows", &error))?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventInfoRow {
    event_timestamp: DateTime<Utc>,
    lease_acquisition_timestamp: Option<DateTime<Utc>>,
    is_within_epsilon: bool,
    lease_validity_status: i32,
    linger: i64,
    db_current_timestamp: DateTime<Utc>,
}

impl EventInfoRow {
    fn into_event_info(self) -> AppResult<EventInfo> {
        Ok(EventInfo {
            event_time_millis: self.event_timestamp.timestamp_millis(),
            lease_acquisition_time_millis: self
                .lease_acquisition_timestamp
                .map(|timestamp| timestamp.timestamp_millis()),
            is_within_epsilon: self.is_within_epsilon,
            validity: LeaseValidity::parse(self.lease_validity_status)?,
            linger_millis: self.linger,
            current_time_millis: self.db_current_timestamp.timestamp_millis(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    event_timestamp: Option<DateTime<Utc>>,
    lease_acquisition_timestamp: Option<DateTime<Utc>>,
    linger: i64,
}

impl SnapshotRow {
    fn into_row_snapshot(self) -> AppResult<RowSnapshot> {
        // The column is NOT NULL and only ever written from the store clock.
        let event_timestamp = self.event_timestamp.ok_or_else(|| {
            AppError::Invariant("lease row re-select returned a null event timestamp".to_owned())
        })?;

        Ok(RowSnapshot {
            event_time_millis: event_timestamp.timestamp_millis(),
            lease_acquisition_time_millis: self
                .lease_acquisition_timestamp
                .map(|timestamp| timestamp.timestamp_millis()),
            linger_millis: self.linger,
        })
    }
}

fn timestamp_from_millis(millis: i64) -> AppResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        AppError::Validation(format!("timestamp {millis} ms is outside the supported range"))
    })
}

/// Duplicate-key races never reach this mapping (the insert absorbs them via
/// `ON CONFLICT DO NOTHING`); remaining integrity violations are surfaced as
/// conflicts, connection-level failures as transient.
fn map_store_error(context: &str, error: &sqlx::Error) -> AppError {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            AppError::Transient(format!("{context}: {error}"))
        }
        sqlx::Error::Database(database_error) => {
            let code = database_error.code().unwrap_or_default().into_owned();
            // Class 08 is a connection exception; 40001/40P01 are
            // serialization failures and deadlocks, safe to retry.
            if code.starts_with("08") || code == "40001" || code == "40P01" {
                AppError::Transient(format!("{context}: {error}"))
            } else if database_error.is_unique_violation()
                || database_error.is_foreign_key_violation()
                || database_error.is_check_violation()
            {
                AppError::Conflict(format!("{context}: {error}"))
            } else {
                AppError::Internal(format!("{context}: {error}"))
            }
        }
        _ => AppError::Internal(format!("{context}: {error}")),
    }
}

#[cfg(test)]
mod tests;
