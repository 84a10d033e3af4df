//! Database layer tests
//!
//! Exercise the claim queries and dead-letter transitions against a
//! real temporary SQLite file.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use super::database::Database;
use super::models::*;
use crate::error::AppError;

async fn test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::connect(&temp_dir.path().join("test.db"))
        .await
        .unwrap();
    (db, temp_dir)
}

fn pending_reminder(n: usize) -> Reminder {
    let now = Utc::now();
    Reminder {
        id: format!("reminder-{n:02}"),
        user_id: "user-1".to_string(),
        event_id: "event-1".to_string(),
        scheduled_for: now - Duration::minutes(5),
        status: JobStatus::Pending,
        attempt_count: 0,
        max_attempts: 3,
        claimed_at: None,
        delivered_at: None,
        last_error: None,
        delivery_note: None,
        created_at: now,
    }
}

fn failed_delivery(id: &str, attempt_count: i64, status: DeliveryStatus) -> FailedDelivery {
    let now = Utc::now();
    FailedDelivery {
        id: id.to_string(),
        activity_id: format!("https://local.example/activities/{id}"),
        activity_type: "Create".to_string(),
        activity: r#"{"type":"Create"}"#.to_string(),
        inbox_url: format!("https://remote.example/inbox/{id}"),
        user_id: "user-1".to_string(),
        status,
        attempt_count,
        max_attempts: 3,
        last_error: Some("connection refused".to_string()),
        last_error_code: Some("network_error".to_string()),
        last_attempt_at: Some(now),
        next_retry_at: if status.is_terminal() {
            None
        } else {
            Some(now - Duration::seconds(1))
        },
        resolved_at: None,
        resolved_by: None,
        created_at: now,
    }
}

#[tokio::test]
async fn claim_due_reminders_returns_disjoint_sets() {
    let (db, _dir) = test_db().await;
    for n in 0..10 {
        db.insert_reminder(&pending_reminder(n)).await.unwrap();
    }

    let now = Utc::now();
    let first = db.claim_due_reminders(now, 5).await.unwrap();
    let second = db.claim_due_reminders(now, 5).await.unwrap();

    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);

    let mut all: Vec<&str> = first
        .iter()
        .chain(second.iter())
        .map(|r| r.id.as_str())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 10, "no reminder may be claimed twice");

    // Nothing left to claim.
    let third = db.claim_due_reminders(now, 5).await.unwrap();
    assert!(third.is_empty());
}

#[tokio::test]
async fn claim_skips_future_and_non_pending_reminders() {
    let (db, _dir) = test_db().await;

    let mut future = pending_reminder(0);
    future.scheduled_for = Utc::now() + Duration::hours(1);
    db.insert_reminder(&future).await.unwrap();

    let mut done = pending_reminder(1);
    done.status = JobStatus::Done;
    db.insert_reminder(&done).await.unwrap();

    let claimed = db.claim_due_reminders(Utc::now(), 10).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn finalize_reminder_requires_live_claim() {
    let (db, _dir) = test_db().await;
    db.insert_reminder(&pending_reminder(0)).await.unwrap();

    let now = Utc::now();
    let claimed = db.claim_due_reminders(now, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let id = claimed[0].id.clone();

    db.finalize_reminder_delivered(&id, Some("email failed: smtp down"), now)
        .await
        .unwrap();

    // Claim is gone; a second finalize must report the lost claim.
    match db.finalize_reminder_delivered(&id, None, now).await {
        Err(AppError::ClaimLost) => {}
        other => panic!("expected ClaimLost, got: {other:?}"),
    }
}

#[tokio::test]
async fn fail_reminder_attempt_requeues_until_exhausted() {
    let (db, _dir) = test_db().await;
    let mut reminder = pending_reminder(0);
    reminder.max_attempts = 2;
    db.insert_reminder(&reminder).await.unwrap();

    let now = Utc::now();

    // First failure requeues to pending.
    let claimed = db.claim_due_reminders(now, 1).await.unwrap();
    db.fail_reminder_attempt(&claimed[0].id, "notifier unavailable")
        .await
        .unwrap();
    let claimed = db.claim_due_reminders(now, 1).await.unwrap();
    assert_eq!(claimed.len(), 1, "requeued reminder should be claimable");
    assert_eq!(claimed[0].attempt_count, 1);

    // Second failure exhausts the budget.
    db.fail_reminder_attempt(&claimed[0].id, "notifier unavailable")
        .await
        .unwrap();
    assert!(db.claim_due_reminders(now, 1).await.unwrap().is_empty());

    let row = sqlx::query_as::<_, Reminder>("SELECT * FROM reminders WHERE id = ?")
        .bind(&claimed[0].id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.attempt_count, 2);
}

#[tokio::test]
async fn upsert_failed_delivery_never_regresses_terminal_status() {
    let (db, _dir) = test_db().await;

    let record = failed_delivery("d1", 3, DeliveryStatus::Failed);
    db.upsert_failed_delivery(&record).await.unwrap();

    // A later live failure for the same (activity, inbox) must not
    // reopen the terminal record.
    let mut retry = failed_delivery("d1-new", 0, DeliveryStatus::Pending);
    retry.activity_id = record.activity_id.clone();
    retry.inbox_url = record.inbox_url.clone();
    db.upsert_failed_delivery(&retry).await.unwrap();

    let stored = db.get_failed_delivery("d1").await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.attempt_count, 3);
}

#[tokio::test]
async fn due_failed_deliveries_filters_status_and_time() {
    let (db, _dir) = test_db().await;

    db.upsert_failed_delivery(&failed_delivery("due", 1, DeliveryStatus::Pending))
        .await
        .unwrap();

    let mut not_due = failed_delivery("later", 1, DeliveryStatus::Pending);
    not_due.next_retry_at = Some(Utc::now() + Duration::hours(1));
    db.upsert_failed_delivery(&not_due).await.unwrap();

    db.upsert_failed_delivery(&failed_delivery("dead", 3, DeliveryStatus::Failed))
        .await
        .unwrap();

    let due = db.due_failed_deliveries(Utc::now(), 100).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, "due");
}

#[tokio::test]
async fn reap_stuck_exports_requeues_then_fails() {
    let (db, _dir) = test_db().await;
    let now = Utc::now();

    let fresh = ExportJob {
        id: "fresh".to_string(),
        user_id: "user-1".to_string(),
        status: JobStatus::Pending,
        requested_at: now,
        claimed_at: None,
        attempt_count: 0,
        max_retries: 2,
        output_path: None,
        last_error: None,
        completed_at: None,
    };
    db.insert_export_job(&fresh).await.unwrap();

    let claimed = db.claim_export_jobs(now, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Not yet stale: reaper leaves it alone.
    let (requeued, failed) = db
        .reap_stuck_exports(now - Duration::minutes(10), now)
        .await
        .unwrap();
    assert_eq!((requeued, failed), (0, 0));

    // Stale with retries left: requeued.
    let (requeued, failed) = db
        .reap_stuck_exports(now + Duration::seconds(1), now)
        .await
        .unwrap();
    assert_eq!((requeued, failed), (1, 0));

    let job = db.get_export_job("fresh").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);

    // Exhaust retries, then the reaper marks it terminally failed.
    sqlx::query("UPDATE export_jobs SET attempt_count = max_retries, status = 'in_progress', claimed_at = ? WHERE id = 'fresh'")
        .bind(now - Duration::hours(1))
        .execute(db.pool())
        .await
        .unwrap();
    let (requeued, failed) = db
        .reap_stuck_exports(now - Duration::minutes(10), now)
        .await
        .unwrap();
    assert_eq!((requeued, failed), (0, 1));

    let job = db.get_export_job("fresh").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn refresh_popularity_scores_applies_formula() {
    let (db, _dir) = test_db().await;
    let now = Utc::now();

    db.upsert_event(&Event {
        id: "event-1".to_string(),
        user_id: "user-1".to_string(),
        title: "Spring picnic".to_string(),
        starts_at: now + Duration::days(3),
        attendance_count: 7,
        like_count: 4,
        popularity_score: 0,
        created_at: now,
    })
    .await
    .unwrap();

    let updated = db
        .refresh_popularity_scores(&["event-1".to_string()])
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let event = db.get_event("event-1").await.unwrap().unwrap();
    assert_eq!(event.popularity_score, 7 * 2 + 4);
}
