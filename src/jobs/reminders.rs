//! Reminder dispatch
//!
//! Claims due reminders and delivers each one as two side effects: an
//! in-app notification (required) and an email (best effort). An email
//! failure is recorded as a note on the reminder; the reminder still
//! finalizes as delivered.

use std::sync::Arc;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};

use crate::data::{Database, Reminder};
use crate::error::AppError;
use crate::metrics;
use crate::service::{Mailer, Notifier};

use super::dispatcher::JobCycle;

pub struct ReminderDispatcher {
    db: Database,
    notifier: Arc<dyn Notifier>,
    mailer: Arc<dyn Mailer>,
    claim_batch_size: u32,
}

impl ReminderDispatcher {
    pub fn new(
        db: Database,
        notifier: Arc<dyn Notifier>,
        mailer: Arc<dyn Mailer>,
        claim_batch_size: u32,
    ) -> Self {
        Self {
            db,
            notifier,
            mailer,
            claim_batch_size,
        }
    }

    /// Claim due reminders and process them concurrently.
    pub async fn run_once(&self) -> Result<(), AppError> {
        let now = Utc::now();
        let claimed = self.db.claim_due_reminders(now, self.claim_batch_size).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = claimed.len(), "Claimed due reminders");
        join_all(claimed.iter().map(|r| self.process_one(r))).await;
        Ok(())
    }

    /// Deliver one claimed reminder; failures stay on this item.
    async fn process_one(&self, reminder: &Reminder) {
        match self.deliver(reminder).await {
            Ok(()) => {
                metrics::JOB_ITEMS_TOTAL
                    .with_label_values(&["reminders", "done"])
                    .inc();
            }
            Err(AppError::ClaimLost) => {
                // A racing worker finalized it; nothing to do.
                tracing::debug!(reminder_id = %reminder.id, "Reminder claim lost");
                metrics::JOB_ITEMS_TOTAL
                    .with_label_values(&["reminders", "claim_lost"])
                    .inc();
            }
            Err(e) => {
                tracing::warn!(reminder_id = %reminder.id, error = %e, "Reminder delivery failed");
                metrics::JOB_ITEMS_TOTAL
                    .with_label_values(&["reminders", "failed"])
                    .inc();
                let failed = self.db.fail_reminder_attempt(&reminder.id, &e.to_string()).await;
                if let Err(AppError::ClaimLost) = failed {
                    tracing::debug!(reminder_id = %reminder.id, "Reminder claim lost during failure handling");
                } else if let Err(e) = failed {
                    tracing::error!(reminder_id = %reminder.id, error = %e, "Failed to record reminder failure");
                }
            }
        }
    }

    async fn deliver(&self, reminder: &Reminder) -> Result<(), AppError> {
        let event = self
            .db
            .get_event(&reminder.event_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let user = self
            .db
            .get_user(&reminder.user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let title = format!("Upcoming event: {}", event.title);
        let body = format!(
            "{} starts at {}",
            event.title,
            event.starts_at.format("%Y-%m-%d %H:%M UTC")
        );
        let context_url = format!("/events/{}", event.id);

        // Required side effect: a failure here fails the attempt.
        self.notifier
            .create(
                &user.id,
                "event_reminder",
                &title,
                &body,
                Some(&context_url),
                Some(serde_json::json!({ "event_id": event.id })),
            )
            .await?;

        // Best-effort side effect: a failure becomes a note.
        let note = match &user.email {
            Some(email) => match self.mailer.send(email, &title, &body).await {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(
                        reminder_id = %reminder.id,
                        error = %e,
                        "Reminder email failed, finalizing as delivered anyway"
                    );
                    Some(format!("email send failed: {}", e))
                }
            },
            None => None,
        };

        self.db
            .finalize_reminder_delivered(&reminder.id, note.as_deref(), Utc::now())
            .await
    }
}

impl JobCycle for ReminderDispatcher {
    fn name(&self) -> &'static str {
        "reminders"
    }

    fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(self.run_once())
    }
}
