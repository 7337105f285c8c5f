use async_trait::async_trait;
use flowlease_core::{AppError, AppResult};
use flowlease_domain::{ActionKey, LeaseParams};

/// Lease validity reported by the store for one action event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseValidity {
    /// A holder claimed the lease and its linger period has not elapsed.
    Valid,
    /// The holder's linger period elapsed without completion.
    Expired,
    /// The lease was completed; the acquisition timestamp is cleared.
    Finished,
}

impl LeaseValidity {
    /// Parses the storage status code.
    pub fn parse(code: i32) -> AppResult<Self> {
        match code {
            1 => Ok(Self::Valid),
            2 => Ok(Self::Expired),
            3 => Ok(Self::Finished),
            _ => Err(AppError::Invariant(format!(
                "unknown lease validity status code {code}"
            ))),
        }
    }

    /// Returns the storage status code.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Valid => 1,
            Self::Expired => 2,
            Self::Finished => 3,
        }
    }
}

/// Arbitration-relevant state of one lease row, joined with the shared
/// epsilon/linger constants and the store clock in a single round trip.
///
/// All times are epoch milliseconds UTC, laundered through the store clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    /// Laundered time of the most recent distinct trigger event.
    pub event_time_millis: i64,
    /// Laundered claim instant; absent when no participant holds the lease.
    pub lease_acquisition_time_millis: Option<i64>,
    /// Whether the probing event consolidates with the stored one. For live
    /// events: the store clock is within epsilon of the stored event time.
    /// For reminders: the reminder's event time is not newer than the stored
    /// one by more than epsilon (one-sided; the far-older case exits the
    /// state machine before this flag is consulted).
    pub is_within_epsilon: bool,
    /// Lease validity at the time of the read.
    pub validity: LeaseValidity,
    /// Linger constant shared by all participants.
    pub linger_millis: i64,
    /// Store clock at the time of the read.
    pub current_time_millis: i64,
}

/// Row state re-read after a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSnapshot {
    /// Laundered event time now present in the row.
    pub event_time_millis: i64,
    /// Laundered claim instant; absent when a racer already completed.
    pub lease_acquisition_time_millis: Option<i64>,
    /// Linger constant shared by all participants.
    pub linger_millis: i64,
}

/// Store port for lease arbitration state.
///
/// Every mutation is a conditional write against the caller's last read, and
/// every write of a timestamp uses the store's own clock. Implementations
/// must execute each operation as one atomic statement; cross-statement
/// consistency is the caller's concern.
#[async_trait]
pub trait LeaseStateRepository: Send + Sync {
    /// Reads current lease state for the params' action key, or `None` when
    /// the key has never been claimed. The reminder flag on the params
    /// selects the reminder flavor of the epsilon check.
    async fn find_event_info(&self, params: &LeaseParams) -> AppResult<Option<EventInfo>>;

    /// Claims a lease by inserting a fresh row, both timestamps set to the
    /// store clock. Returns rows affected; 0 means another participant
    /// created the row first.
    async fn insert_new_lease(&self, action: &ActionKey) -> AppResult<u64>;

    /// Re-claims an expired lease when the row still matches the previously
    /// read event and acquisition times. Returns rows affected.
    async fn reacquire_expired_lease(
        &self,
        action: &ActionKey,
        expected_event_millis: i64,
        expected_lease_millis: i64,
    ) -> AppResult<u64>;

    /// Claims a finished lease when the row still matches the previously
    /// read event time and carries no acquisition time. Returns rows
    /// affected.
    async fn reacquire_finished_lease(
        &self,
        action: &ActionKey,
        expected_event_millis: i64,
    ) -> AppResult<u64>;

    /// Re-reads the row after a claim attempt. `None` means the row vanished,
    /// which callers treat as a fatal invariant violation.
    async fn find_row_snapshot(&self, action: &ActionKey) -> AppResult<Option<RowSnapshot>>;

    /// Clears the acquisition timestamp when the row still matches the
    /// obtained lease. Returns rows affected.
    async fn clear_lease(
        &self,
        action: &ActionKey,
        event_time_millis: i64,
        lease_acquisition_millis: i64,
    ) -> AppResult<u64>;

    /// Deletes rows whose event time fell behind the retention horizon.
    /// Returns the number of deleted rows.
    async fn delete_rows_past_retention(&self) -> AppResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::LeaseValidity;

    #[test]
    fn validity_codes_round_trip() {
        for validity in [
            LeaseValidity::Valid,
            LeaseValidity::Expired,
            LeaseValidity::Finished,
        ] {
            assert_eq!(LeaseValidity::parse(validity.code()).unwrap(), validity);
        }
    }

    #[test]
    fn unknown_validity_code_is_fatal() {
        assert!(LeaseValidity::parse(0).is_err());
        assert!(LeaseValidity::parse(4).is_err());
    }
}
