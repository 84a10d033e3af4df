//! Background job flows
//!
//! Reminder, export, and popularity dispatch against a temporary
//! database: exactly-once claiming across cycles, the required/
//! best-effort side-effect split, and export output.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::*;
use futures::future::BoxFuture;
use rallypoint::data::{Database, Event, ExportJob, JobStatus, Reminder};
use rallypoint::error::AppError;
use rallypoint::jobs::{ExportDispatcher, PopularityRefresher, ReminderDispatcher};
use rallypoint::service::{DbNotifier, Mailer, Notifier};

// =============================================================================
// Side-effect fakes
// =============================================================================

#[derive(Default)]
struct RecordingMailer {
    sends: AtomicUsize,
    fail: bool,
}

impl RecordingMailer {
    fn failing() -> Self {
        Self {
            sends: AtomicUsize::new(0),
            fail: true,
        }
    }

    fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl Mailer for RecordingMailer {
    fn send<'a>(
        &'a self,
        _to: &'a str,
        _subject: &'a str,
        _text: &'a str,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::Internal(anyhow::anyhow!("smtp down")))
            } else {
                Ok(())
            }
        })
    }
}

struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn create<'a>(
        &'a self,
        _user_id: &'a str,
        _kind: &'a str,
        _title: &'a str,
        _body: &'a str,
        _context_url: Option<&'a str>,
        _data: Option<serde_json::Value>,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move { Err(AppError::Internal(anyhow::anyhow!("notifier unavailable"))) })
    }
}

// =============================================================================
// Seeding
// =============================================================================

async fn seed_event(db: &Database, id: &str, user_id: &str, attendance: i64, likes: i64) {
    db.upsert_event(&Event {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: "Spring picnic".to_string(),
        starts_at: Utc::now() + Duration::days(3),
        attendance_count: attendance,
        like_count: likes,
        popularity_score: 0,
        created_at: Utc::now(),
    })
    .await
    .unwrap();
}

async fn seed_reminder(db: &Database, n: usize, user_id: &str, event_id: &str, max_attempts: i64) {
    db.insert_reminder(&Reminder {
        id: format!("reminder-{n:02}"),
        user_id: user_id.to_string(),
        event_id: event_id.to_string(),
        scheduled_for: Utc::now() - Duration::minutes(5),
        status: JobStatus::Pending,
        attempt_count: 0,
        max_attempts,
        claimed_at: None,
        delivered_at: None,
        last_error: None,
        delivery_note: None,
        created_at: Utc::now(),
    })
    .await
    .unwrap();
}

async fn reminder_by_id(db: &Database, id: &str) -> Reminder {
    sqlx::query_as::<_, Reminder>("SELECT * FROM reminders WHERE id = ?")
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap()
}

// =============================================================================
// Reminders
// =============================================================================

#[tokio::test]
async fn ten_reminders_across_two_cycles_process_exactly_once() {
    let app = spawn_app().await;
    let user = seed_user(app.db(), "u1", "alice").await;
    seed_event(app.db(), "event-1", &user.id, 0, 0).await;
    for n in 0..10 {
        seed_reminder(app.db(), n, &user.id, "event-1", 3).await;
    }

    let mailer = Arc::new(RecordingMailer::default());
    let dispatcher = ReminderDispatcher::new(
        app.db().clone(),
        Arc::new(DbNotifier::new(app.db().clone())),
        mailer.clone(),
        5,
    );

    dispatcher.run_once().await.unwrap();
    dispatcher.run_once().await.unwrap();

    // Every reminder produced exactly one notification.
    let notifications = app.db().notifications_for_user(&user.id).await.unwrap();
    assert_eq!(notifications.len(), 10);
    assert_eq!(mailer.send_count(), 10);

    for n in 0..10 {
        let reminder = reminder_by_id(app.db(), &format!("reminder-{n:02}")).await;
        assert_eq!(reminder.status, JobStatus::Done);
        assert!(reminder.delivered_at.is_some());
    }

    // A third cycle finds nothing left.
    dispatcher.run_once().await.unwrap();
    assert_eq!(
        app.db().notifications_for_user(&user.id).await.unwrap().len(),
        10
    );
}

#[tokio::test]
async fn email_failure_still_finalizes_reminder_as_delivered() {
    let app = spawn_app().await;
    let user = seed_user(app.db(), "u1", "alice").await;
    seed_event(app.db(), "event-1", &user.id, 0, 0).await;
    seed_reminder(app.db(), 0, &user.id, "event-1", 3).await;

    let dispatcher = ReminderDispatcher::new(
        app.db().clone(),
        Arc::new(DbNotifier::new(app.db().clone())),
        Arc::new(RecordingMailer::failing()),
        5,
    );
    dispatcher.run_once().await.unwrap();

    let reminder = reminder_by_id(app.db(), "reminder-00").await;
    assert_eq!(reminder.status, JobStatus::Done);
    assert!(
        reminder
            .delivery_note
            .as_deref()
            .unwrap()
            .contains("email send failed"),
        "email failure recorded as a note"
    );

    // The required notification still exists.
    assert_eq!(
        app.db().notifications_for_user(&user.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn notification_failure_fails_the_attempt() {
    let app = spawn_app().await;
    let user = seed_user(app.db(), "u1", "alice").await;
    seed_event(app.db(), "event-1", &user.id, 0, 0).await;
    seed_reminder(app.db(), 0, &user.id, "event-1", 2).await;

    let dispatcher = ReminderDispatcher::new(
        app.db().clone(),
        Arc::new(FailingNotifier),
        Arc::new(RecordingMailer::default()),
        5,
    );

    // First failure requeues with the error recorded.
    dispatcher.run_once().await.unwrap();
    let reminder = reminder_by_id(app.db(), "reminder-00").await;
    assert_eq!(reminder.status, JobStatus::Pending);
    assert_eq!(reminder.attempt_count, 1);
    assert!(reminder.last_error.is_some());

    // Second failure exhausts the budget.
    dispatcher.run_once().await.unwrap();
    let reminder = reminder_by_id(app.db(), "reminder-00").await;
    assert_eq!(reminder.status, JobStatus::Failed);
    assert_eq!(reminder.attempt_count, 2);
}

#[tokio::test]
async fn reminder_without_email_skips_the_mailer() {
    let app = spawn_app().await;
    let user = seed_keyless_user(app.db(), "u1", "alice").await;
    seed_event(app.db(), "event-1", &user.id, 0, 0).await;
    seed_reminder(app.db(), 0, &user.id, "event-1", 3).await;

    let mailer = Arc::new(RecordingMailer::default());
    let dispatcher = ReminderDispatcher::new(
        app.db().clone(),
        Arc::new(DbNotifier::new(app.db().clone())),
        mailer.clone(),
        5,
    );
    dispatcher.run_once().await.unwrap();

    let reminder = reminder_by_id(app.db(), "reminder-00").await;
    assert_eq!(reminder.status, JobStatus::Done);
    assert!(reminder.delivery_note.is_none());
    assert_eq!(mailer.send_count(), 0);
}

// =============================================================================
// Export
// =============================================================================

#[tokio::test]
async fn export_writes_json_and_finalizes() {
    let app = spawn_app().await;
    let user = seed_user(app.db(), "u1", "alice").await;
    seed_event(app.db(), "event-1", &user.id, 3, 1).await;
    seed_event(app.db(), "event-2", &user.id, 0, 0).await;
    seed_follower(app.db(), &user.id, 1, None).await;

    let job = ExportJob {
        id: "export-1".to_string(),
        user_id: user.id.clone(),
        status: JobStatus::Pending,
        requested_at: Utc::now(),
        claimed_at: None,
        attempt_count: 0,
        max_retries: 2,
        output_path: None,
        last_error: None,
        completed_at: None,
    };
    app.db().insert_export_job(&job).await.unwrap();

    let export_dir = app.state.config.jobs.export_dir.clone();
    let dispatcher = ExportDispatcher::new(
        app.db().clone(),
        export_dir,
        std::time::Duration::from_secs(600),
        10,
    );
    dispatcher.run_once().await.unwrap();

    let stored = app.db().get_export_job("export-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert!(stored.completed_at.is_some());

    let path = stored.output_path.expect("completed export has a path");
    let contents = std::fs::read_to_string(&path).unwrap();
    let payload: serde_json::Value = serde_json::from_str(&contents).unwrap();

    assert_eq!(payload["user"]["username"], "alice");
    assert_eq!(payload["events"].as_array().unwrap().len(), 2);
    assert_eq!(payload["followers"].as_array().unwrap().len(), 1);
    assert!(
        !contents.contains("encrypted_private_key"),
        "key material must never reach an export"
    );
}

#[tokio::test]
async fn missing_user_fails_the_export_attempt() {
    let app = spawn_app().await;

    let job = ExportJob {
        id: "export-1".to_string(),
        user_id: "ghost".to_string(),
        status: JobStatus::Pending,
        requested_at: Utc::now(),
        claimed_at: None,
        attempt_count: 0,
        max_retries: 1,
        output_path: None,
        last_error: None,
        completed_at: None,
    };
    app.db().insert_export_job(&job).await.unwrap();

    let dispatcher = ExportDispatcher::new(
        app.db().clone(),
        app.state.config.jobs.export_dir.clone(),
        std::time::Duration::from_secs(600),
        10,
    );
    dispatcher.run_once().await.unwrap();

    let stored = app.db().get_export_job("export-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending, "requeued with retries left");
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.last_error.is_some());
}

// =============================================================================
// Popularity
// =============================================================================

#[tokio::test]
async fn popularity_refresh_rescore_is_idempotent() {
    let app = spawn_app().await;
    let user = seed_user(app.db(), "u1", "alice").await;
    seed_event(app.db(), "event-1", &user.id, 7, 4).await;
    seed_event(app.db(), "event-2", &user.id, 1, 0).await;

    let refresher = PopularityRefresher::new(app.db().clone(), 1);
    refresher.run_once().await.unwrap();

    let first = app.db().get_event("event-1").await.unwrap().unwrap();
    assert_eq!(first.popularity_score, 7 * 2 + 4);
    let second = app.db().get_event("event-2").await.unwrap().unwrap();
    assert_eq!(second.popularity_score, 2);

    // Running again changes nothing.
    refresher.run_once().await.unwrap();
    let again = app.db().get_event("event-1").await.unwrap().unwrap();
    assert_eq!(again.popularity_score, 18);
}
