//! Dead-letter queue
//!
//! Deliveries that exhaust their immediate retries are persisted here
//! and re-attempted on a capped exponential backoff schedule. The
//! periodic sweep runs sequentially on purpose: dead-letter retries
//! are a background trickle, not a burst of outbound traffic.
//!
//! Operators can also retry or discard individual records by hand.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;

use crate::data::{Database, DeliveryStatus, EntityId, FailedDelivery};
use crate::error::AppError;
use crate::jobs::JobCycle;
use crate::metrics;

use super::delivery::{DeliveryEngine, DeliveryFailure, OutboundActivity};

/// Backoff before retry `attempt`, in milliseconds.
///
/// `min(1000 * 2^attempt, 3_600_000)`: 1s, 2s, 4s, ... capped at one
/// hour.
pub fn backoff_delay_ms(attempt: i64) -> u64 {
    let exp = attempt.clamp(0, 22) as u32;
    (1000u64 << exp).min(3_600_000)
}

fn next_retry_after(now: DateTime<Utc>, attempt: i64) -> DateTime<Utc> {
    now + ChronoDuration::milliseconds(backoff_delay_ms(attempt) as i64)
}

/// Persist a failed delivery for scheduled re-attempts.
///
/// Records arriving with their attempt budget already spent are marked
/// terminally failed on insert instead of being scheduled.
pub async fn record_failure(
    db: &Database,
    activity: &OutboundActivity,
    inbox_url: &str,
    user_id: &str,
    attempt_count: i64,
    failure: &DeliveryFailure,
    max_attempts: i64,
) -> Result<(), AppError> {
    let now = Utc::now();
    let exhausted = attempt_count >= max_attempts;

    let record = FailedDelivery {
        id: EntityId::new().0,
        activity_id: activity.id.clone(),
        activity_type: activity.kind.clone(),
        activity: serde_json::to_string(&activity.payload)
            .map_err(|e| AppError::Internal(e.into()))?,
        inbox_url: inbox_url.to_string(),
        user_id: user_id.to_string(),
        status: if exhausted {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Pending
        },
        attempt_count,
        max_attempts,
        last_error: Some(failure.message.clone()),
        last_error_code: Some(failure.code.to_string()),
        last_attempt_at: Some(now),
        next_retry_at: if exhausted {
            None
        } else {
            Some(next_retry_after(now, attempt_count))
        },
        resolved_at: if exhausted { Some(now) } else { None },
        resolved_by: None,
        created_at: now,
    };

    db.upsert_failed_delivery(&record).await?;

    let outcome = if exhausted { "fast_failed" } else { "recorded" };
    metrics::DEAD_LETTERS_TOTAL.with_label_values(&[outcome]).inc();
    tracing::info!(
        activity_id = %activity.id,
        inbox_url = %inbox_url,
        attempt_count,
        outcome,
        "Dead-lettered delivery"
    );
    Ok(())
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

/// Periodic retry of dead-lettered deliveries.
#[derive(Clone)]
pub struct DeadLetterQueue {
    db: Database,
    engine: DeliveryEngine,
    select_limit: u32,
    process_limit: usize,
}

impl DeadLetterQueue {
    pub fn new(db: Database, engine: DeliveryEngine, select_limit: u32, process_limit: usize) -> Self {
        Self {
            db,
            engine,
            select_limit,
            process_limit,
        }
    }

    fn activity_from_record(record: &FailedDelivery) -> Result<OutboundActivity, AppError> {
        let payload: serde_json::Value = serde_json::from_str(&record.activity)
            .map_err(|e| AppError::Federation(format!("Corrupt dead-letter payload: {}", e)))?;
        Ok(OutboundActivity {
            id: record.activity_id.clone(),
            kind: record.activity_type.clone(),
            payload,
        })
    }

    /// One sweep over due records.
    ///
    /// Selects due pending rows, filters out any with an exhausted
    /// budget, and re-attempts the rest one at a time. A single bad
    /// record never halts the sweep.
    pub async fn process_queue(&self) -> Result<SweepReport, AppError> {
        let now = Utc::now();
        let due = self.db.due_failed_deliveries(now, self.select_limit).await?;

        let eligible: Vec<FailedDelivery> = due
            .into_iter()
            .filter(|r| r.attempt_count < r.max_attempts)
            .take(self.process_limit)
            .collect();

        let mut report = SweepReport::default();
        for record in &eligible {
            report.processed += 1;
            match self.process_one(record).await {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Rescheduled) => report.rescheduled += 1,
                Ok(Outcome::Exhausted) => report.failed += 1,
                Err(e) => {
                    // Requeue so the record is not stranded in retrying.
                    tracing::error!(
                        record_id = %record.id,
                        error = %e,
                        "Dead-letter retry errored"
                    );
                    let requeue = self
                        .db
                        .reschedule_failed_delivery(
                            &record.id,
                            record.attempt_count + 1,
                            next_retry_after(Utc::now(), record.attempt_count + 1),
                            &e.to_string(),
                            "internal_error",
                            Utc::now(),
                        )
                        .await;
                    if let Err(e) = requeue {
                        tracing::error!(record_id = %record.id, error = %e, "Failed to requeue dead-letter record");
                    }
                    report.rescheduled += 1;
                }
            }
        }

        if let Ok(pending) = self.db.count_pending_dead_letters().await {
            metrics::DEAD_LETTERS_PENDING.set(pending);
        }

        if report.processed > 0 {
            tracing::info!(
                processed = report.processed,
                delivered = report.delivered,
                rescheduled = report.rescheduled,
                failed = report.failed,
                "Dead-letter sweep complete"
            );
        }
        Ok(report)
    }

    async fn process_one(&self, record: &FailedDelivery) -> Result<Outcome, AppError> {
        self.db.mark_delivery_retrying(&record.id).await?;

        let identity = self.db.identity_for_user(&record.user_id).await?;
        let activity = Self::activity_from_record(record)?;

        match self
            .engine
            .try_deliver_once(&activity, &record.inbox_url, &identity)
            .await
        {
            Ok(()) => {
                self.db.delete_failed_delivery(&record.id).await?;
                metrics::DEAD_LETTERS_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                tracing::info!(
                    record_id = %record.id,
                    activity_id = %record.activity_id,
                    "Dead-lettered delivery succeeded"
                );
                Ok(Outcome::Delivered)
            }
            Err(failure) => {
                let now = Utc::now();
                let attempts = record.attempt_count + 1;
                if attempts >= record.max_attempts {
                    self.db
                        .mark_delivery_failed(
                            &record.id,
                            attempts,
                            &failure.message,
                            failure.code,
                            now,
                        )
                        .await?;
                    metrics::DEAD_LETTERS_TOTAL
                        .with_label_values(&["exhausted"])
                        .inc();
                    tracing::warn!(
                        record_id = %record.id,
                        activity_id = %record.activity_id,
                        attempts,
                        "Dead-lettered delivery exhausted its retries"
                    );
                    Ok(Outcome::Exhausted)
                } else {
                    self.db
                        .reschedule_failed_delivery(
                            &record.id,
                            attempts,
                            next_retry_after(now, attempts),
                            &failure.message,
                            failure.code,
                            now,
                        )
                        .await?;
                    Ok(Outcome::Rescheduled)
                }
            }
        }
    }

    /// Operator-triggered single retry.
    ///
    /// Deletes the record on success; on failure the record is left
    /// exactly as it was.
    ///
    /// # Returns
    /// `true` if the delivery went through.
    pub async fn retry(&self, id: &str) -> Result<bool, AppError> {
        let record = self
            .db
            .get_failed_delivery(id)
            .await?
            .ok_or(AppError::NotFound)?;

        let identity = self.db.identity_for_user(&record.user_id).await?;
        let activity = Self::activity_from_record(&record)?;

        match self
            .engine
            .try_deliver_once(&activity, &record.inbox_url, &identity)
            .await
        {
            Ok(()) => {
                self.db.delete_failed_delivery(id).await?;
                metrics::DEAD_LETTERS_TOTAL
                    .with_label_values(&["manual_retry_ok"])
                    .inc();
                Ok(true)
            }
            Err(failure) => {
                tracing::warn!(
                    record_id = %id,
                    code = failure.code,
                    error = %failure.message,
                    "Manual dead-letter retry failed"
                );
                Ok(false)
            }
        }
    }

    /// Operator-triggered terminal discard.
    pub async fn discard(&self, id: &str, resolved_by: &str) -> Result<(), AppError> {
        self.db
            .discard_failed_delivery(id, resolved_by, Utc::now())
            .await?;
        metrics::DEAD_LETTERS_TOTAL
            .with_label_values(&["discarded"])
            .inc();
        tracing::info!(record_id = %id, resolved_by = %resolved_by, "Discarded dead-letter record");
        Ok(())
    }
}

enum Outcome {
    Delivered,
    Rescheduled,
    Exhausted,
}

impl JobCycle for DeadLetterQueue {
    fn name(&self) -> &'static str {
        "dead_letter_sweep"
    }

    fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(async move {
            self.process_queue().await?;
            Ok(())
        })
    }
}
