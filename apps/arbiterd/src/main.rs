//! Flowlease maintenance daemon.
//!
//! Bootstraps the lease arbitration tables, publishes the shared constants
//! and keeps the retention sweep running. Arbitrating participants embed the
//! arbiter service directly; this binary owns the shared housekeeping.

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowlease_core::{AppError, AppResult};
use flowlease_infrastructure::{
    PostgresLeaseArbiterConfig, PostgresLeaseRepository, RetentionSweeper,
};

const DEFAULT_EPSILON_MILLIS: i64 = 5_000;
const DEFAULT_LINGER_MILLIS: i64 = 30_000;
const DEFAULT_RETENTION_MILLIS: i64 = 7 * 24 * 60 * 60 * 1_000;
const DEFAULT_SWEEP_INTERVAL_MILLIS: u64 = 4 * 60 * 60 * 1_000;

#[derive(Debug, Clone)]
struct ArbiterdConfig {
    database_url: String,
    lease: PostgresLeaseArbiterConfig,
    sweep_interval_millis: u64,
}

impl ArbiterdConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let lease = PostgresLeaseArbiterConfig {
            lease_table: required_env("LEASE_ARBITER_TABLE")?,
            constants_table: required_env("LEASE_ARBITER_CONSTANTS_TABLE")?,
            epsilon_millis: parse_env_i64("LEASE_ARBITER_EPSILON_MS", DEFAULT_EPSILON_MILLIS)?,
            linger_millis: parse_env_i64("LEASE_ARBITER_LINGER_MS", DEFAULT_LINGER_MILLIS)?,
            retention_millis: parse_env_i64(
                "LEASE_ARBITER_RETENTION_MS",
                DEFAULT_RETENTION_MILLIS,
            )?,
        };
        lease.validate()?;
        let sweep_interval_millis = parse_env_u64(
            "LEASE_ARBITER_SWEEP_INTERVAL_MS",
            DEFAULT_SWEEP_INTERVAL_MILLIS,
        )?;

        if sweep_interval_millis == 0 {
            return Err(AppError::Validation(
                "LEASE_ARBITER_SWEEP_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            database_url,
            lease,
            sweep_interval_millis,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ArbiterdConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    let repository = Arc::new(PostgresLeaseRepository::new(pool, config.lease.clone())?);
    repository.bootstrap().await?;

    info!(
        lease_table = %config.lease.lease_table,
        sweep_interval_millis = config.sweep_interval_millis,
        "flowlease-arbiterd started"
    );

    let sweeper = RetentionSweeper::new(
        repository,
        Duration::from_millis(config.sweep_interval_millis),
    );
    let sweep_handle = sweeper.spawn();

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| AppError::Internal(format!("failed to await shutdown signal: {error}")))?;
    info!("shutdown signal received, stopping retention sweep");
    sweep_handle.abort();

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_i64(name: &str, default: i64) -> AppResult<i64> {
    match env::var(name) {
        Ok(value) => value.parse::<i64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
