//! In-memory lease arbitration state for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use flowlease_application::{EventInfo, LeaseStateRepository, LeaseValidity, RowSnapshot};
use flowlease_core::AppResult;
use flowlease_domain::{ActionKey, LeaseParams};

#[derive(Debug, Clone, Copy)]
struct LeaseRow {
    event_time_millis: i64,
    lease_acquisition_time_millis: Option<i64>,
}

/// In-memory implementation of the lease arbitration state port.
///
/// Carries the same conditional-write semantics as the PostgreSQL adapter,
/// with the process clock standing in for the store clock. The clock can be
/// moved forward explicitly, which lets tests cross the epsilon, linger and
/// retention horizons without waiting them out.
#[derive(Debug)]
pub struct InMemoryLeaseRepository {
    epsilon_millis: i64,
    linger_millis: i64,
    retention_millis: i64,
    rows: RwLock<HashMap<ActionKey, LeaseRow>>,
    clock_skew_millis: RwLock<i64>,
}

impl InMemoryLeaseRepository {
    /// Creates an empty repository with the given arbitration constants.
    #[must_use]
    pub fn new(epsilon_millis: i64, linger_millis: i64, retention_millis: i64) -> Self {
        Self {
            epsilon_millis,
            linger_millis,
            retention_millis,
            rows: RwLock::new(HashMap::new()),
            clock_skew_millis: RwLock::new(0),
        }
    }

    /// Moves the repository clock forward, standing in for elapsed wall time.
    pub async fn advance_clock(&self, millis: i64) {
        *self.clock_skew_millis.write().await += millis;
    }

    async fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis() + *self.clock_skew_millis.read().await
    }
}

#[async_trait]
impl LeaseStateRepository for InMemoryLeaseRepository {
    async fn find_event_info(&self, params: &LeaseParams) -> AppResult<Option<EventInfo>> {
        let now = self.now_millis().await;
        let rows = self.rows.read().await;

        let Some(row) = rows.get(params.action()) else {
            return Ok(None);
        };

        let is_within_epsilon = if params.is_reminder() {
            params.event_time_millis() - row.event_time_millis <= self.epsilon_millis
        } else {
            (now - row.event_time_millis).abs() <= self.epsilon_millis
        };
        let validity = match row.lease_acquisition_time_millis {
            Some(acquired) if now < acquired + self.linger_millis => LeaseValidity::Valid,
            Some(_) => LeaseValidity::Expired,
            None => LeaseValidity::Finished,
        };

        Ok(Some(EventInfo {
            event_time_millis: row.event_time_millis,
            lease_acquisition_time_millis: row.lease_acquisition_time_millis,
            is_within_epsilon,
            validity,
            linger_millis: self.linger_millis,
            current_time_millis: now,
        }))
    }

    async fn insert_new_lease(&self, action: &ActionKey) -> AppResult<u64> {
        let now = self.now_millis().await;
        let mut rows = self.rows.write().await;

        if rows.contains_key(action) {
            return Ok(0);
        }

        rows.insert(
            action.clone(),
            LeaseRow {
                event_time_millis: now,
                lease_acquisition_time_millis: Some(now),
            },
        );
        Ok(1)
    }

    async fn reacquire_expired_lease(
        &self,
        action: &ActionKey,
        expected_event_millis: i64,
        expected_lease_millis: i64,
    ) -> AppResult<u64> {
        let now = self.now_millis().await;
        let mut rows = self.rows.write().await;

        match rows.get_mut(action) {
            Some(row)
                if row.event_time_millis == expected_event_millis
                    && row.lease_acquisition_time_millis == Some(expected_lease_millis) =>
            {
                row.event_time_millis = now;
                row.lease_acquisition_time_millis = Some(now);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn reacquire_finished_lease(
        &self,
        action: &ActionKey,
        expected_event_millis: i64,
    ) -> AppResult<u64> {
        let now = self.now_millis().await;
        let mut rows = self.rows.write().await;

        match rows.get_mut(action) {
            Some(row)
                if row.event_time_millis == expected_event_millis
                    && row.lease_acquisition_time_millis.is_none() =>
            {
                row.event_time_millis = now;
                row.lease_acquisition_time_millis = Some(now);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn find_row_snapshot(&self, action: &ActionKey) -> AppResult<Option<RowSnapshot>> {
        let rows = self.rows.read().await;

        Ok(rows.get(action).map(|row| RowSnapshot {
            event_time_millis: row.event_time_millis,
            lease_acquisition_time_millis: row.lease_acquisition_time_millis,
            linger_millis: self.linger_millis,
        }))
    }

    async fn clear_lease(
        &self,
        action: &ActionKey,
        event_time_millis: i64,
        lease_acquisition_millis: i64,
    ) -> AppResult<u64> {
        let mut rows = self.rows.write().await;

        match rows.get_mut(action) {
            Some(row)
                if row.event_time_millis == event_time_millis
                    && row.lease_acquisition_time_millis == Some(lease_acquisition_millis) =>
            {
                row.lease_acquisition_time_millis = None;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_rows_past_retention(&self) -> AppResult<u64> {
        let now = self.now_millis().await;
        let horizon = now - self.retention_millis;
        let mut rows = self.rows.write().await;

        let before = rows.len();
        rows.retain(|_, row| row.event_time_millis >= horizon);
        Ok((before - rows.len()) as u64)
    }
}
