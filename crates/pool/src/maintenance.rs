// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

use std::{sync::Arc, time::Duration};

use metrics::Counter;
use metrics_derive::Metrics;
use opbundler_utils::retry::{self, RetryOpts};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::db::{Database, DbError};

/// Maintenance task settings
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Time between maintenance runs
    pub interval: Duration,
    /// Retries within a single run
    pub retry: RetryOpts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retry: RetryOpts::default(),
        }
    }
}

/// Periodically runs database maintenance.
///
/// A failed run is logged and counted, the next tick tries again.
pub struct MaintenanceTask<D> {
    db: Arc<D>,
    settings: Settings,
    metrics: MaintenanceMetrics,
}

impl<D: Database> MaintenanceTask<D> {
    /// Create the task
    pub fn new(db: Arc<D>, settings: Settings) -> Self {
        Self {
            db,
            settings,
            metrics: MaintenanceMetrics::default(),
        }
    }

    /// Run forever
    pub async fn run(self) -> anyhow::Result<()> {
        let mut tick = time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        tick.tick().await;
        loop {
            tick.tick().await;
            let _ = self.run_once().await;
        }
    }

    async fn run_once(&self) -> Result<u64, DbError> {
        self.metrics.runs.increment(1);
        let result = retry::with_retries(
            "run database maintenance",
            || {
                let db = Arc::clone(&self.db);
                async move {
                    tokio::task::spawn_blocking(move || db.run_maintenance())
                        .await
                        .map_err(|e| DbError::Storage(e.to_string()))?
                }
            },
            self.settings.retry,
        )
        .await;

        match &result {
            Ok(reclaimed) => {
                debug!("database maintenance reclaimed {reclaimed} slots");
                self.metrics.reclaimed.increment(*reclaimed);
            }
            Err(e) => {
                warn!("database maintenance failed, retrying next interval: {e}");
                self.metrics.failures.increment(1);
            }
        }
        result
    }
}

#[derive(Metrics)]
#[metrics(scope = "op_pool_db")]
struct MaintenanceMetrics {
    #[metric(describe = "the count of maintenance runs.")]
    runs: Counter,
    #[metric(describe = "the count of maintenance runs that failed after retries.")]
    failures: Counter,
    #[metric(describe = "the count of storage slots reclaimed by maintenance.")]
    reclaimed: Counter,
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;

    use super::*;
    use crate::db::MockDatabase;

    fn settings() -> Settings {
        Settings {
            interval: Duration::from_secs(60),
            retry: RetryOpts {
                max_attempts: 3,
                min_nonzero_wait: Duration::from_millis(10),
                max_wait: Duration::from_millis(100),
                max_jitter: Duration::ZERO,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let mut seq = Sequence::new();
        let mut db = MockDatabase::new();
        db.expect_run_maintenance()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Err(DbError::Storage("busy".into())));
        db.expect_run_maintenance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(7));

        let task = MaintenanceTask::new(Arc::new(db), settings());
        assert_eq!(task.run_once().await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let mut db = MockDatabase::new();
        db.expect_run_maintenance()
            .times(3)
            .returning(|| Err(DbError::Storage("corrupt".into())));

        let task = MaintenanceTask::new(Arc::new(db), settings());
        assert!(matches!(
            task.run_once().await,
            Err(DbError::Storage(m)) if m == "corrupt"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let mut db = MockDatabase::new();
        db.expect_run_maintenance()
            .returning(|| Err(DbError::Storage("corrupt".into())));

        let handle = tokio::spawn(MaintenanceTask::new(Arc::new(db), settings()).run());
        time::sleep(Duration::from_secs(600)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
