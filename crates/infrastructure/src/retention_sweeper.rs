//! Periodic retention sweep over the lease table.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use flowlease_application::LeaseStateRepository;

/// Periodically deletes lease rows whose event time fell behind the retention
/// horizon. Retention dwarfs linger, so every deleted row is finished or long
/// expired regardless of its lease state.
pub struct RetentionSweeper {
    repository: Arc<dyn LeaseStateRepository>,
    interval: Duration,
}

impl RetentionSweeper {
    /// Creates a sweeper over the given repository.
    #[must_use]
    pub fn new(repository: Arc<dyn LeaseStateRepository>, interval: Duration) -> Self {
        Self {
            repository,
            interval,
        }
    }

    /// Spawns the sweep loop; the first sweep runs immediately. Sweep
    /// failures are logged and the loop carries on.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.repository.delete_rows_past_retention().await {
                    Ok(0) => debug!("retention sweep found nothing to delete"),
                    Ok(deleted) => info!(deleted, "retention sweep deleted stale lease rows"),
                    Err(error) => warn!(error = %error, "retention sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use flowlease_application::{LeaseArbiterService, LeaseStateRepository};
    use flowlease_domain::{ActionKey, ActionType, LeaseParams};

    use super::RetentionSweeper;
    use crate::in_memory_lease_repository::InMemoryLeaseRepository;

    #[tokio::test]
    async fn sweeper_drains_rows_past_the_retention_horizon() {
        let repository = Arc::new(InMemoryLeaseRepository::new(50, 500, 2_000));
        let arbiter = LeaseArbiterService::new(repository.clone());
        let action = ActionKey::new("etl", "hourly", "ingest", ActionType::Launch)
            .expect("valid key");

        arbiter
            .try_acquire_lease(&LeaseParams::new(action.clone(), 1_000), true)
            .await
            .unwrap();
        repository.advance_clock(2_500).await;

        let handle = RetentionSweeper::new(repository.clone(), Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(repository
            .find_row_snapshot(&action)
            .await
            .unwrap()
            .is_none());
    }
}
