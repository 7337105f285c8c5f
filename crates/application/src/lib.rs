//! Application services and ports.

#![forbid(unsafe_code)]

mod backoff;
mod lease_arbiter_service;
mod lease_ports;

pub use backoff::ExponentialBackoff;
pub use lease_arbiter_service::LeaseArbiterService;
pub use lease_ports::{EventInfo, LeaseStateRepository, LeaseValidity, RowSnapshot};
