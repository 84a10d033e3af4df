//! Data export
//!
//! Builds a JSON export of a user's account, events, and followers.
//! Each cycle first reaps exports abandoned in progress past the
//! timeout (crashed worker), requeuing them while retries remain, then
//! claims and processes fresh jobs concurrently.
//!
//! Output files are written through a temp file and renamed into
//! place, so a partially written export is never visible.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::json;

use crate::data::{Database, ExportJob};
use crate::error::AppError;
use crate::metrics;

use super::dispatcher::JobCycle;

pub struct ExportDispatcher {
    db: Database,
    export_dir: PathBuf,
    stuck_timeout: Duration,
    claim_batch_size: u32,
}

impl ExportDispatcher {
    pub fn new(
        db: Database,
        export_dir: PathBuf,
        stuck_timeout: Duration,
        claim_batch_size: u32,
    ) -> Self {
        Self {
            db,
            export_dir,
            stuck_timeout,
            claim_batch_size,
        }
    }

    pub async fn run_once(&self) -> Result<(), AppError> {
        let now = Utc::now();

        let cutoff = now
            - chrono::Duration::from_std(self.stuck_timeout)
                .map_err(|e| AppError::Config(format!("Invalid export timeout: {}", e)))?;
        let (requeued, reaped_failed) = self.db.reap_stuck_exports(cutoff, now).await?;
        if requeued > 0 || reaped_failed > 0 {
            tracing::warn!(requeued, failed = reaped_failed, "Reaped stuck export jobs");
            metrics::JOB_ITEMS_TOTAL
                .with_label_values(&["export", "reaped"])
                .inc_by(requeued + reaped_failed);
        }

        let claimed = self.db.claim_export_jobs(now, self.claim_batch_size).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = claimed.len(), "Claimed export jobs");
        join_all(claimed.iter().map(|job| self.process_one(job))).await;
        Ok(())
    }

    async fn process_one(&self, job: &ExportJob) {
        match self.export(job).await {
            Ok(path) => {
                metrics::JOB_ITEMS_TOTAL
                    .with_label_values(&["export", "done"])
                    .inc();
                tracing::info!(job_id = %job.id, path = %path, "Export complete");
            }
            Err(AppError::ClaimLost) => {
                tracing::debug!(job_id = %job.id, "Export claim lost");
                metrics::JOB_ITEMS_TOTAL
                    .with_label_values(&["export", "claim_lost"])
                    .inc();
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Export failed");
                metrics::JOB_ITEMS_TOTAL
                    .with_label_values(&["export", "failed"])
                    .inc();
                let failed = self
                    .db
                    .fail_export_attempt(&job.id, &e.to_string(), Utc::now())
                    .await;
                if let Err(AppError::ClaimLost) = failed {
                    tracing::debug!(job_id = %job.id, "Export claim lost during failure handling");
                } else if let Err(e) = failed {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to record export failure");
                }
            }
        }
    }

    async fn export(&self, job: &ExportJob) -> Result<String, AppError> {
        let user = self
            .db
            .get_user(&job.user_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let events = self.db.events_for_user(&job.user_id).await?;
        let followers = self.db.accepted_followers(&job.user_id).await?;

        // Key material stays out of the export.
        let payload = json!({
            "exported_at": Utc::now(),
            "user": {
                "id": user.id,
                "username": user.username,
                "email": user.email,
                "actor_url": user.actor_url,
                "created_at": user.created_at,
            },
            "events": events,
            "followers": followers,
        });

        let path = self.export_dir.join(format!("export-{}.json", job.id));
        self.write_atomically(&path, &payload)?;

        let path_str = path.to_string_lossy().into_owned();
        self.db
            .finalize_export_done(&job.id, &path_str, Utc::now())
            .await?;
        Ok(path_str)
    }

    fn write_atomically(&self, path: &std::path::Path, payload: &serde_json::Value) -> Result<(), AppError> {
        std::fs::create_dir_all(&self.export_dir).map_err(|e| AppError::Internal(e.into()))?;

        let mut file = tempfile::NamedTempFile::new_in(&self.export_dir)
            .map_err(|e| AppError::Internal(e.into()))?;
        let body = serde_json::to_vec_pretty(payload).map_err(|e| AppError::Internal(e.into()))?;
        file.write_all(&body).map_err(|e| AppError::Internal(e.into()))?;
        file.persist(path)
            .map_err(|e| AppError::Internal(e.error.into()))?;
        Ok(())
    }
}

impl JobCycle for ExportDispatcher {
    fn name(&self) -> &'static str {
        "export"
    }

    fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(self.run_once())
    }
}
