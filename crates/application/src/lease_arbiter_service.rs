use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use flowlease_core::{AppError, AppResult};
use flowlease_domain::{
    ActionKey, LeaseAttemptStatus, LeaseObtained, LeaseParams, LeasedToAnother,
};

use crate::backoff::ExponentialBackoff;
use crate::lease_ports::{EventInfo, LeaseStateRepository, LeaseValidity};

const MAX_INSERT_ATTEMPTS: u32 = 3;
const MIN_INITIAL_DELAY_MILLIS: u64 = 20;
const RETRY_JITTER_RANGE_MILLIS: u64 = 200;

/// Arbitrates ownership of action events amongst competing participants.
///
/// Several stateless peers may race to act on the same trigger event; the
/// shared store is the single source of truth and every decision here is made
/// from one store read plus conditional writes that only land when the row
/// still matches that read. Timestamps the caller supplies are never
/// persisted: rows only ever carry the store's own clock, so comparisons all
/// happen in one clock domain regardless of drift between participants.
#[derive(Clone)]
pub struct LeaseArbiterService {
    repository: Arc<dyn LeaseStateRepository>,
}

impl LeaseArbiterService {
    /// Creates a lease arbiter over the given state repository.
    #[must_use]
    pub fn new(repository: Arc<dyn LeaseStateRepository>) -> Self {
        Self { repository }
    }

    /// Attempts to acquire the lease for the params' action event.
    ///
    /// When `adopt_consensus_event_time` is set, the returned params carry
    /// the laundered store time in place of the caller's event time, so all
    /// participants converge on identical event identifiers downstream.
    pub async fn try_acquire_lease(
        &self,
        params: &LeaseParams,
        adopt_consensus_event_time: bool,
    ) -> AppResult<LeaseAttemptStatus> {
        info!(lease = %params, "arbitrating lease ownership");
        let status = self.arbitrate(params, adopt_consensus_event_time).await?;
        // When the event time was rewritten, log the consensus params rather
        // than the caller's originals.
        info!(
            status = status.as_str(),
            lease = %status.consensus_params().unwrap_or(params),
            "lease arbitration outcome"
        );
        Ok(status)
    }

    /// Records that the obtained lease's work completed, clearing the lease.
    ///
    /// Returns `false` when the lease already expired and was re-claimed or
    /// swept away; the completion is then simply dropped.
    pub async fn record_lease_success(&self, obtained: &LeaseObtained) -> AppResult<bool> {
        let params = &obtained.consensus_params;
        let rows_updated = self
            .repository
            .clear_lease(
                params.action(),
                obtained.event_time_millis,
                obtained.lease_acquisition_millis,
            )
            .await?;

        match rows_updated {
            0 => {
                info!(
                    lease = %params,
                    "lease completion missed, row expired or was re-claimed before this attempt"
                );
                Ok(false)
            }
            1 => {
                info!(lease = %params, "lease completed, no longer leasing this event");
                Ok(true)
            }
            more => Err(AppError::Invariant(format!(
                "lease completion for {params} updated {more} rows"
            ))),
        }
    }

    /// Returns whether a lease row consolidating with the params' event
    /// already exists.
    pub async fn exists_similar_lease_within_consolidation_period(
        &self,
        params: &LeaseParams,
    ) -> AppResult<bool> {
        Ok(self
            .repository
            .find_event_info(params)
            .await?
            .is_some_and(|info| info.is_within_epsilon))
    }

    /// Bounds the multiple returns of the decision cases so the caller can
    /// uniformly log every kind of outcome.
    async fn arbitrate(
        &self,
        params: &LeaseParams,
        adopt_consensus_event_time: bool,
    ) -> AppResult<LeaseAttemptStatus> {
        let Some(info) = self.repository.find_event_info(params).await? else {
            // CASE 1: the action event has no row yet; create it now.
            debug!(lease = %params, "no lease row yet, creating one");
            let rows_updated = self.insert_with_backoff(params.action()).await?;
            return self
                .evaluate_after_claim(rows_updated, params, None, adopt_consensus_event_time)
                .await;
        };

        if params.is_reminder() {
            if params.event_time_millis() < info.event_time_millis {
                info!(
                    lease = %params,
                    db_event_time_millis = info.event_time_millis,
                    "newer event in store, discarding out-of-date reminder"
                );
                return Ok(LeaseAttemptStatus::NoLongerLeasing);
            }
            if params.event_time_millis() > info.event_time_millis {
                warn!(
                    lease = %params,
                    db_event_time_millis = info.event_time_millis,
                    "store event time older than reminder event; laundered event times must be \
                     monotonically nondecreasing"
                );
            }
            if params.event_time_millis() == info.event_time_millis {
                debug!(lease = %params, "store event time matches reminder");
            }
        }

        // TODO: exempt reminder params from the rewrite? they already carry a
        // laundered event time
        if adopt_consensus_event_time {
            info!(
                db_current_time_millis = info.current_time_millis,
                lease = %params,
                "store time will replace the caller's event time"
            );
        }

        match info.validity {
            LeaseValidity::Valid if info.is_within_epsilon => {
                // CASE 2: same event, lease is valid elsewhere. The stored
                // event time names the event for everyone.
                let consensus_params = consensus_params(
                    params,
                    info.event_time_millis,
                    adopt_consensus_event_time,
                );
                debug!(lease = %consensus_params, "same event, lease held by another participant");
                Ok(LeaseAttemptStatus::LeasedToAnother(LeasedToAnother {
                    consensus_params,
                    minimum_linger_millis: remaining_linger(&info)?,
                }))
            }
            LeaseValidity::Valid => {
                // CASE 3: distinct event while an older one is still leased;
                // the store clock names the new event so the caller can
                // schedule a reminder for it.
                let consensus_params = consensus_params(
                    params,
                    info.current_time_millis,
                    adopt_consensus_event_time,
                );
                debug!(lease = %consensus_params, "distinct event, lease held by another participant");
                Ok(LeaseAttemptStatus::LeasedToAnother(LeasedToAnother {
                    consensus_params,
                    minimum_linger_millis: remaining_linger(&info)?,
                }))
            }
            LeaseValidity::Expired => {
                // CASE 4: lease out of date, same or distinct event alike.
                debug!(
                    lease = %params,
                    db_current_time_millis = info.current_time_millis,
                    "lease expired, attempting takeover"
                );
                if info.is_within_epsilon && !params.is_reminder() {
                    warn!(
                        lease = %params,
                        db_event_time_millis = info.event_time_millis,
                        db_lease_acquisition_millis = info.lease_acquisition_time_millis,
                        db_linger_millis = info.linger_millis,
                        "lease expired for the same trigger event; epsilon is expected to be far \
                         smaller than linger"
                    );
                }
                let expected_lease_millis = info.lease_acquisition_time_millis.ok_or_else(|| {
                    AppError::Invariant(
                        "expired lease row is missing its acquisition timestamp".to_owned(),
                    )
                })?;
                let rows_updated = self
                    .repository
                    .reacquire_expired_lease(
                        params.action(),
                        info.event_time_millis,
                        expected_lease_millis,
                    )
                    .await?;
                self.evaluate_after_claim(
                    rows_updated,
                    params,
                    Some(info.current_time_millis),
                    adopt_consensus_event_time,
                )
                .await
            }
            LeaseValidity::Finished if info.is_within_epsilon => {
                // CASE 5: same event, already completed.
                debug!(
                    lease = %params,
                    db_current_time_millis = info.current_time_millis,
                    "same event already completed, no longer leasing"
                );
                Ok(LeaseAttemptStatus::NoLongerLeasing)
            }
            LeaseValidity::Finished => {
                // CASE 6: distinct event on a completed row; claim it.
                debug!(
                    lease = %params,
                    db_current_time_millis = info.current_time_millis,
                    "distinct event on a completed row, attempting claim"
                );
                let rows_updated = self
                    .repository
                    .reacquire_finished_lease(params.action(), info.event_time_millis)
                    .await?;
                self.evaluate_after_claim(
                    rows_updated,
                    params,
                    Some(info.current_time_millis),
                    adopt_consensus_event_time,
                )
                .await
            }
        }
    }

    /// INSERT-IF-ABSENT with retries on transient store errors only. A lost
    /// race reports zero rows affected and is not an error.
    async fn insert_with_backoff(&self, action: &ActionKey) -> AppResult<u64> {
        let jitter_millis = rand::thread_rng().gen_range(0..RETRY_JITTER_RANGE_MILLIS);
        let initial_delay = Duration::from_millis(MIN_INITIAL_DELAY_MILLIS + jitter_millis);
        let mut backoff = ExponentialBackoff::new(MAX_INSERT_ATTEMPTS - 1, initial_delay);

        loop {
            match self.repository.insert_new_lease(action).await {
                Ok(rows_updated) => return Ok(rows_updated),
                Err(AppError::Transient(reason)) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(AppError::Transient(reason));
                    };
                    debug!(
                        action = %action,
                        delay_millis = delay.as_millis() as u64,
                        "transient store error while creating lease row, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Re-reads the row after a claim attempt and maps the combination of
    /// rows-affected and current row state to the final status. Mandatory
    /// after every claim: the store clock value just written is unknown until
    /// read back, and a racer may have cleared or re-claimed in between.
    async fn evaluate_after_claim(
        &self,
        rows_updated: u64,
        params: &LeaseParams,
        db_current_time_millis: Option<i64>,
        adopt_consensus_event_time: bool,
    ) -> AppResult<LeaseAttemptStatus> {
        let snapshot = self
            .repository
            .find_row_snapshot(params.action())
            .await?
            .ok_or_else(|| {
                AppError::Invariant(format!(
                    "lease row for {} disappeared between claim and re-select",
                    params.action()
                ))
            })?;

        // A racer completed the lease between the claim and the re-select.
        let Some(lease_acquisition_millis) = snapshot.lease_acquisition_time_millis else {
            return Ok(LeaseAttemptStatus::NoLongerLeasing);
        };

        let consensus_params = consensus_params(
            params,
            snapshot.event_time_millis,
            adopt_consensus_event_time,
        );
        // Without a store clock reading from this round, the full linger is
        // the only safe wait hint.
        let minimum_linger_millis = match db_current_time_millis {
            Some(current_time_millis) => {
                lease_acquisition_millis + snapshot.linger_millis - current_time_millis
            }
            None => snapshot.linger_millis,
        };

        if rows_updated == 1 {
            info!(lease = %consensus_params, lease_acquisition_millis, "lease obtained");
            Ok(LeaseAttemptStatus::Obtained(LeaseObtained {
                consensus_params,
                event_time_millis: snapshot.event_time_millis,
                lease_acquisition_millis,
                minimum_linger_millis,
            }))
        } else {
            info!(
                lease = %consensus_params,
                rows_updated,
                "another participant acquired the lease first"
            );
            Ok(LeaseAttemptStatus::LeasedToAnother(LeasedToAnother {
                consensus_params,
                minimum_linger_millis,
            }))
        }
    }
}

fn consensus_params(
    params: &LeaseParams,
    laundered_event_millis: i64,
    adopt_consensus_event_time: bool,
) -> LeaseParams {
    if adopt_consensus_event_time {
        params.with_event_time_millis(laundered_event_millis)
    } else {
        params.clone()
    }
}

fn remaining_linger(info: &EventInfo) -> AppResult<i64> {
    let lease_acquisition_millis = info.lease_acquisition_time_millis.ok_or_else(|| {
        AppError::Invariant("valid lease row is missing its acquisition timestamp".to_owned())
    })?;
    Ok(lease_acquisition_millis + info.linger_millis - info.current_time_millis)
}
