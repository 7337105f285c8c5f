use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use flowlease_application::{LeaseArbiterService, LeaseStateRepository};
use flowlease_domain::{ActionKey, ActionType, LeaseAttemptStatus, LeaseObtained, LeaseParams};

use super::{PostgresLeaseArbiterConfig, PostgresLeaseRepository};

fn config(suffix: &str, epsilon: i64, linger: i64, retention: i64) -> PostgresLeaseArbiterConfig {
    PostgresLeaseArbiterConfig {
        lease_table: format!("lease_arbiter_test_{suffix}"),
        constants_table: format!("lease_constants_test_{suffix}"),
        epsilon_millis: epsilon,
        linger_millis: linger,
        retention_millis: retention,
    }
}

#[test]
fn config_rejects_unsafe_table_names() {
    let mut bad = config("ok", 10, 100, 1_000);
    bad.lease_table = "lease; DROP TABLE users".to_owned();
    assert!(bad.validate().is_err());

    let mut numeric_first = config("ok", 10, 100, 1_000);
    numeric_first.constants_table = "1constants".to_owned();
    assert!(numeric_first.validate().is_err());
}

#[test]
fn config_enforces_horizon_ordering() {
    assert!(config("ok", 10, 100, 1_000).validate().is_ok());
    assert!(config("bad", 0, 100, 1_000).validate().is_err());
    assert!(config("bad", 100, 100, 1_000).validate().is_err());
    assert!(config("bad", 10, 1_000, 1_000).validate().is_err());
}

async fn test_pool() -> Option<PgPool> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        return None;
    };

    let pool = match PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url.as_str())
        .await
    {
        Ok(pool) => pool,
        Err(error) => panic!("failed to connect to DATABASE_URL in test: {error}"),
    };

    Some(pool)
}

async fn repository(
    pool: &PgPool,
    epsilon: i64,
    linger: i64,
    retention: i64,
) -> Arc<PostgresLeaseRepository> {
    let suffix = Uuid::new_v4().simple().to_string();
    let repository = PostgresLeaseRepository::new(
        pool.clone(),
        config(suffix.as_str(), epsilon, linger, retention),
    )
    .expect("valid config");
    repository.bootstrap().await.expect("bootstrap succeeds");
    Arc::new(repository)
}

async fn drop_tables(pool: &PgPool, repository: &PostgresLeaseRepository) {
    for table in [
        repository.config.lease_table.as_str(),
        repository.config.constants_table.as_str(),
    ] {
        let drop = sqlx::query(format!("DROP TABLE IF EXISTS {table}").as_str())
            .execute(pool)
            .await;
        assert!(drop.is_ok());
    }
}

fn action() -> ActionKey {
    ActionKey::new("etl", "hourly", "ingest", ActionType::Launch).expect("valid key")
}

fn launch_params() -> LeaseParams {
    LeaseParams::new(action(), 1_000)
}

async fn obtain(arbiter: &LeaseArbiterService, params: &LeaseParams) -> LeaseObtained {
    match arbiter.try_acquire_lease(params, true).await.unwrap() {
        LeaseAttemptStatus::Obtained(obtained) => obtained,
        other => panic!("expected obtained, got {}", other.as_str()),
    }
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let repository = repository(&pool, 5_000, 30_000, 600_000).await;
    repository.bootstrap().await.expect("second bootstrap succeeds");

    drop_tables(&pool, &repository).await;
}

#[tokio::test]
async fn claim_contend_and_complete_round_trip() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let repository = repository(&pool, 5_000, 30_000, 600_000).await;
    let arbiter = LeaseArbiterService::new(repository.clone());

    let obtained = obtain(&arbiter, &launch_params()).await;
    assert!(obtained.lease_acquisition_millis > 0);
    assert_eq!(obtained.minimum_linger_millis, 30_000);

    // A contender arriving within epsilon converges on the laundered event
    // time and receives a wait hint bounded by the linger.
    let status = arbiter
        .try_acquire_lease(&launch_params(), true)
        .await
        .unwrap();
    let LeaseAttemptStatus::LeasedToAnother(leased) = status else {
        panic!("expected leased_to_another, got {}", status.as_str());
    };
    assert_eq!(
        leased.consensus_params.event_time_millis(),
        obtained.event_time_millis
    );
    assert!(leased.minimum_linger_millis > 0);
    assert!(leased.minimum_linger_millis <= 30_000);

    assert!(arbiter
        .exists_similar_lease_within_consolidation_period(&launch_params())
        .await
        .unwrap());

    assert!(arbiter.record_lease_success(&obtained).await.unwrap());
    assert!(!arbiter.record_lease_success(&obtained).await.unwrap());

    // A reminder for the caller's original (pre-laundering) event time finds
    // a newer store event and stands down.
    let reminder = LeaseParams::reminder(action(), 1_000);
    let status = arbiter.try_acquire_lease(&reminder, true).await.unwrap();
    assert_eq!(status, LeaseAttemptStatus::NoLongerLeasing);

    drop_tables(&pool, &repository).await;
}

#[tokio::test]
async fn expired_lease_is_taken_over() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let repository = repository(&pool, 10, 100, 600_000).await;
    let arbiter = LeaseArbiterService::new(repository.clone());

    let first = obtain(&arbiter, &launch_params()).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let second = obtain(&arbiter, &launch_params()).await;
    assert!(second.lease_acquisition_millis >= first.lease_acquisition_millis + 100);
    assert!(second.event_time_millis > first.event_time_millis);

    drop_tables(&pool, &repository).await;
}

#[tokio::test]
async fn conditional_writes_refuse_mismatched_snapshots() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let repository = repository(&pool, 5_000, 30_000, 600_000).await;
    let arbiter = LeaseArbiterService::new(repository.clone());

    let obtained = obtain(&arbiter, &launch_params()).await;
    let stale_event = obtained.event_time_millis - 1;

    assert_eq!(
        repository
            .reacquire_expired_lease(&action(), stale_event, obtained.lease_acquisition_millis)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        repository
            .reacquire_finished_lease(&action(), obtained.event_time_millis)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        repository
            .clear_lease(&action(), stale_event, obtained.lease_acquisition_millis)
            .await
            .unwrap(),
        0
    );

    assert!(arbiter.record_lease_success(&obtained).await.unwrap());

    drop_tables(&pool, &repository).await;
}

#[tokio::test]
async fn retention_sweep_deletes_old_rows_and_reopens_the_insert_path() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let repository = repository(&pool, 10, 20, 50).await;
    let arbiter = LeaseArbiterService::new(repository.clone());

    let obtained = obtain(&arbiter, &launch_params()).await;
    assert!(arbiter.record_lease_success(&obtained).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(repository.delete_rows_past_retention().await.unwrap(), 1);

    let second = obtain(&arbiter, &launch_params()).await;
    assert!(second.event_time_millis > obtained.event_time_millis);

    drop_tables(&pool, &repository).await;
}
