//! Popularity refresh
//!
//! Stateless, idempotent recompute of event popularity scores. No
//! claim is taken: recomputing a score twice gives the same answer, so
//! concurrent refreshers are harmless. Runs in keyset batches with a
//! small pause between them to stay off the store's hot path.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::data::Database;
use crate::error::AppError;
use crate::metrics;

use super::dispatcher::JobCycle;

const INTER_BATCH_DELAY: Duration = Duration::from_millis(50);

pub struct PopularityRefresher {
    db: Database,
    batch_size: u32,
}

impl PopularityRefresher {
    pub fn new(db: Database, batch_size: u32) -> Self {
        Self { db, batch_size }
    }

    /// Walk all events in id order, recomputing scores per batch.
    pub async fn run_once(&self) -> Result<(), AppError> {
        let mut cursor: Option<String> = None;
        let mut total = 0u64;

        loop {
            let ids = self.db.event_id_batch(cursor.as_deref(), self.batch_size).await?;
            if ids.is_empty() {
                break;
            }

            let updated = self.db.refresh_popularity_scores(&ids).await?;
            total += updated;
            metrics::JOB_ITEMS_TOTAL
                .with_label_values(&["popularity_refresh", "done"])
                .inc_by(updated);

            cursor = ids.last().cloned();
            tokio::time::sleep(INTER_BATCH_DELAY).await;
        }

        if total > 0 {
            tracing::debug!(updated = total, "Refreshed popularity scores");
        }
        Ok(())
    }
}

impl JobCycle for PopularityRefresher {
    fn name(&self) -> &'static str {
        "popularity_refresh"
    }

    fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(self.run_once())
    }
}
