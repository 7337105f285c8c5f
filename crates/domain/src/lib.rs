//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod action;
mod lease;

pub use action::{
    ActionKey, ActionType, LeaseParams, MAX_FLOW_GROUP_LENGTH, MAX_FLOW_NAME_LENGTH,
    MAX_JOB_NAME_LENGTH,
};
pub use lease::{LeaseAttemptStatus, LeaseObtained, LeasedToAnother};
