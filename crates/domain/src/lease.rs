use crate::action::LeaseParams;

/// Outcome of one lease arbitration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttemptStatus {
    /// The caller now holds the lease and must do the work.
    Obtained(LeaseObtained),
    /// Another participant holds the lease.
    LeasedToAnother(LeasedToAnother),
    /// The event has been completed and requires no further action.
    NoLongerLeasing,
}

impl LeaseAttemptStatus {
    /// Returns stable status label for logging.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Obtained(_) => "obtained",
            Self::LeasedToAnother(_) => "leased_to_another",
            Self::NoLongerLeasing => "no_longer_leasing",
        }
    }

    /// Returns the consensus params carried by the status, when present.
    #[must_use]
    pub fn consensus_params(&self) -> Option<&LeaseParams> {
        match self {
            Self::Obtained(obtained) => Some(&obtained.consensus_params),
            Self::LeasedToAnother(leased) => Some(&leased.consensus_params),
            Self::NoLongerLeasing => None,
        }
    }
}

/// Proof of a held lease, consumed later to record completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseObtained {
    /// Params the caller should act upon; carries the laundered store time
    /// when consensus adoption was requested, the caller's own otherwise.
    pub consensus_params: LeaseParams,
    /// Laundered event time of the held row. The completion update matches
    /// against this value, so it is recorded independently of whether the
    /// consensus params adopted it.
    pub event_time_millis: i64,
    /// Laundered instant at which this caller claimed the lease.
    pub lease_acquisition_millis: i64,
    /// Remaining validity of the lease at acquisition time.
    pub minimum_linger_millis: i64,
}

/// Another participant's claim observed during arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedToAnother {
    /// Params all participants converge on for this event.
    pub consensus_params: LeaseParams,
    /// Minimum wait before re-checking whether the holder's lease expired.
    pub minimum_linger_millis: i64,
}

#[cfg(test)]
mod tests {
    use super::{LeaseAttemptStatus, LeaseObtained, LeasedToAnother};
    use crate::action::{ActionKey, ActionType, LeaseParams};

    fn params() -> LeaseParams {
        let action = ActionKey::new("etl", "hourly", "ingest", ActionType::Launch)
            .expect("valid key");
        LeaseParams::new(action, 1_000)
    }

    #[test]
    fn status_labels_are_stable() {
        let obtained = LeaseAttemptStatus::Obtained(LeaseObtained {
            consensus_params: params(),
            event_time_millis: 1_000,
            lease_acquisition_millis: 1_000,
            minimum_linger_millis: 30_000,
        });
        let leased = LeaseAttemptStatus::LeasedToAnother(LeasedToAnother {
            consensus_params: params(),
            minimum_linger_millis: 30_000,
        });

        assert_eq!(obtained.as_str(), "obtained");
        assert_eq!(leased.as_str(), "leased_to_another");
        assert_eq!(LeaseAttemptStatus::NoLongerLeasing.as_str(), "no_longer_leasing");
    }

    #[test]
    fn consensus_params_absent_when_no_longer_leasing() {
        assert!(LeaseAttemptStatus::NoLongerLeasing.consensus_params().is_none());
    }
}
