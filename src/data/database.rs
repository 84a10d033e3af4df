//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with runtime-bound queries; the claim queries are the
//! correctness core: a single `UPDATE ... WHERE id IN (SELECT ...)
//! RETURNING *` statement guarantees two concurrent claimers always
//! receive disjoint item sets.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to the SQLite database at `path`, creating the file
    /// and running migrations if needed.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Access the underlying pool (tests and ad-hoc admin queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Fetch a user by id.
    pub async fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Fetch the signing identity for a user.
    ///
    /// # Errors
    /// `NotFound` if the user does not exist.
    pub async fn identity_for_user(&self, user_id: &str) -> Result<ActorIdentity, AppError> {
        let user = self.get_user(user_id).await?.ok_or(AppError::NotFound)?;
        Ok(user.identity())
    }

    /// Insert or replace a user row.
    pub async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, actor_url, public_key_pem, encrypted_private_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                email = excluded.email,
                actor_url = excluded.actor_url,
                public_key_pem = excluded.public_key_pem,
                encrypted_private_key = excluded.encrypted_private_key,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.actor_url)
        .bind(&user.public_key_pem)
        .bind(&user.encrypted_private_key)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Followers / peer actors
    // =========================================================================

    /// All accepted followers of a user.
    pub async fn accepted_followers(&self, user_id: &str) -> Result<Vec<Follower>, AppError> {
        let followers = sqlx::query_as::<_, Follower>(
            "SELECT * FROM followers WHERE user_id = ? AND accepted = 1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(followers)
    }

    /// Insert or update a follower record.
    pub async fn upsert_follower(&self, follower: &Follower) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO followers (id, user_id, actor_url, inbox_url, shared_inbox_url, accepted, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, actor_url) DO UPDATE SET
                inbox_url = excluded.inbox_url,
                shared_inbox_url = excluded.shared_inbox_url,
                accepted = excluded.accepted
            "#,
        )
        .bind(&follower.id)
        .bind(&follower.user_id)
        .bind(&follower.actor_url)
        .bind(&follower.inbox_url)
        .bind(&follower.shared_inbox_url)
        .bind(follower.accepted)
        .bind(follower.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a cached remote actor record.
    pub async fn get_peer_actor(&self, actor_url: &str) -> Result<Option<PeerActor>, AppError> {
        let peer = sqlx::query_as::<_, PeerActor>("SELECT * FROM peer_actors WHERE actor_url = ?")
            .bind(actor_url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(peer)
    }

    /// Insert or update a cached remote actor record.
    pub async fn upsert_peer_actor(&self, peer: &PeerActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO peer_actors (actor_url, inbox_url, shared_inbox_url, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(actor_url) DO UPDATE SET
                inbox_url = excluded.inbox_url,
                shared_inbox_url = excluded.shared_inbox_url,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&peer.actor_url)
        .bind(&peer.inbox_url)
        .bind(&peer.shared_inbox_url)
        .bind(peer.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cached actors whose URL lives on the given domain.
    pub async fn peer_actors_for_domain(&self, domain: &str) -> Result<Vec<PeerActor>, AppError> {
        let peers = sqlx::query_as::<_, PeerActor>(
            r#"
            SELECT * FROM peer_actors
            WHERE actor_url LIKE 'https://' || ? || '/%'
               OR actor_url LIKE 'http://' || ? || '/%'
            "#,
        )
        .bind(domain)
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;
        Ok(peers)
    }

    // =========================================================================
    // Dead-letter queue
    // =========================================================================

    /// Insert or refresh a dead-letter record for (activity, inbox).
    ///
    /// Terminal records (failed/discarded) are left untouched so a
    /// status never regresses; a repeated live failure for the same
    /// pair only refreshes non-terminal rows.
    pub async fn upsert_failed_delivery(&self, record: &FailedDelivery) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO failed_deliveries (
                id, activity_id, activity_type, activity, inbox_url, user_id,
                status, attempt_count, max_attempts, last_error, last_error_code,
                last_attempt_at, next_retry_at, resolved_at, resolved_by, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(activity_id, inbox_url) DO UPDATE SET
                activity = excluded.activity,
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error,
                last_error_code = excluded.last_error_code,
                last_attempt_at = excluded.last_attempt_at,
                next_retry_at = excluded.next_retry_at,
                resolved_at = excluded.resolved_at
            WHERE failed_deliveries.status NOT IN ('failed', 'discarded')
            "#,
        )
        .bind(&record.id)
        .bind(&record.activity_id)
        .bind(&record.activity_type)
        .bind(&record.activity)
        .bind(&record.inbox_url)
        .bind(&record.user_id)
        .bind(record.status)
        .bind(record.attempt_count)
        .bind(record.max_attempts)
        .bind(&record.last_error)
        .bind(&record.last_error_code)
        .bind(record.last_attempt_at)
        .bind(record.next_retry_at)
        .bind(record.resolved_at)
        .bind(&record.resolved_by)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending dead-letter rows due for a retry, oldest first.
    pub async fn due_failed_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<FailedDelivery>, AppError> {
        let rows = sqlx::query_as::<_, FailedDelivery>(
            r#"
            SELECT * FROM failed_deliveries
            WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Fetch a single dead-letter record.
    pub async fn get_failed_delivery(&self, id: &str) -> Result<Option<FailedDelivery>, AppError> {
        let row = sqlx::query_as::<_, FailedDelivery>("SELECT * FROM failed_deliveries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Most recent dead-letter records for operator inspection.
    pub async fn list_failed_deliveries(&self, limit: u32) -> Result<Vec<FailedDelivery>, AppError> {
        let rows = sqlx::query_as::<_, FailedDelivery>(
            "SELECT * FROM failed_deliveries ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Flip a pending record to retrying before an attempt.
    pub async fn mark_delivery_retrying(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE failed_deliveries SET status = 'retrying' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a record after a successful re-delivery.
    pub async fn delete_failed_delivery(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM failed_deliveries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed re-attempt that still has retries left.
    pub async fn reschedule_failed_delivery(
        &self,
        id: &str,
        attempt_count: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
        error_code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE failed_deliveries
            SET status = 'pending', attempt_count = ?, next_retry_at = ?,
                last_error = ?, last_error_code = ?, last_attempt_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt_count)
        .bind(next_retry_at)
        .bind(error)
        .bind(error_code)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip a record to terminal failed once attempts are exhausted.
    pub async fn mark_delivery_failed(
        &self,
        id: &str,
        attempt_count: i64,
        error: &str,
        error_code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE failed_deliveries
            SET status = 'failed', attempt_count = ?, next_retry_at = NULL,
                last_error = ?, last_error_code = ?, last_attempt_at = ?, resolved_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt_count)
        .bind(error)
        .bind(error_code)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminally discard a record; no further retries.
    pub async fn discard_failed_delivery(
        &self,
        id: &str,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE failed_deliveries
            SET status = 'discarded', next_retry_at = NULL, resolved_at = ?, resolved_by = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(resolved_by)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Count pending records (metrics gauge).
    pub async fn count_pending_dead_letters(&self) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM failed_deliveries WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Register an instance on first sighting; no-op if already known.
    pub async fn ensure_instance(
        &self,
        domain: &str,
        base_url: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO instances (domain, base_url, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(domain) DO NOTHING
            "#,
        )
        .bind(domain)
        .bind(base_url)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unblocked instances that have never been fetched or are stale,
    /// oldest first. SQLite sorts NULL first on ascending order, so
    /// never-fetched instances lead the batch.
    pub async fn due_instances(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Instance>, AppError> {
        let rows = sqlx::query_as::<_, Instance>(
            r#"
            SELECT * FROM instances
            WHERE is_blocked = 0 AND (last_fetched_at IS NULL OR last_fetched_at <= ?)
            ORDER BY last_fetched_at ASC
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Fetch a single instance by domain.
    pub async fn get_instance(&self, domain: &str) -> Result<Option<Instance>, AppError> {
        let row = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// All known instances (operator inspection).
    pub async fn list_instances(&self) -> Result<Vec<Instance>, AppError> {
        let rows = sqlx::query_as::<_, Instance>("SELECT * FROM instances ORDER BY domain")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Persist a discovered public events endpoint immediately.
    pub async fn set_public_events_url(&self, domain: &str, url: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE instances SET public_events_url = ? WHERE domain = ?")
            .bind(url)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance the pagination cursor after a page with a next token.
    pub async fn advance_instance_cursor(
        &self,
        domain: &str,
        cursor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET last_page_url = ?, last_fetched_at = ?, last_error = NULL, last_error_at = NULL
            WHERE domain = ?
            "#,
        )
        .bind(cursor)
        .bind(now)
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a completed fetch with no cursor advance (end of feed).
    pub async fn record_instance_fetched(
        &self,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET last_fetched_at = ?, last_error = NULL, last_error_at = NULL
            WHERE domain = ?
            "#,
        )
        .bind(now)
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a poll failure on the instance row; never interrupts the
    /// rest of the batch.
    pub async fn record_instance_error(
        &self,
        domain: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET last_error = ?, last_error_at = ?, last_fetched_at = ?
            WHERE domain = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Administrative hard reset of the pagination cursor.
    pub async fn reset_instance_cursor(&self, domain: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET last_page_url = NULL, last_error = NULL, last_error_at = NULL
            WHERE domain = ?
            "#,
        )
        .bind(domain)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Cache an activity pulled from a remote public stream.
    /// Duplicate activity ids are ignored so re-fetching a page is safe.
    pub async fn cache_remote_activity(
        &self,
        activity_id: &str,
        actor_url: &str,
        instance_domain: &str,
        activity: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO remote_activities (id, activity_id, actor_url, instance_domain, activity, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(activity_id) DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(activity_id)
        .bind(actor_url)
        .bind(instance_domain)
        .bind(activity)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Events / popularity
    // =========================================================================

    /// Insert or replace an event row.
    pub async fn upsert_event(&self, event: &Event) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO events (id, user_id, title, starts_at, attendance_count, like_count, popularity_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                starts_at = excluded.starts_at,
                attendance_count = excluded.attendance_count,
                like_count = excluded.like_count
            "#,
        )
        .bind(&event.id)
        .bind(&event.user_id)
        .bind(&event.title)
        .bind(event.starts_at)
        .bind(event.attendance_count)
        .bind(event.like_count)
        .bind(event.popularity_score)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a single event.
    pub async fn get_event(&self, id: &str) -> Result<Option<Event>, AppError> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    /// All events owned by a user (data export).
    pub async fn events_for_user(&self, user_id: &str) -> Result<Vec<Event>, AppError> {
        let events =
            sqlx::query_as::<_, Event>("SELECT * FROM events WHERE user_id = ? ORDER BY starts_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(events)
    }

    /// Keyset page of event ids for the popularity refresher.
    pub async fn event_id_batch(
        &self,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, AppError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM events
            WHERE ?1 IS NULL OR id > ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Recompute popularity scores for a batch of events.
    ///
    /// Idempotent: `score = attendance_count * 2 + like_count`, so a
    /// redundant recompute is harmless and no claim is taken.
    pub async fn refresh_popularity_scores(&self, ids: &[String]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE events SET popularity_score = attendance_count * 2 + like_count WHERE id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Reminders
    // =========================================================================

    /// Insert a reminder row.
    pub async fn insert_reminder(&self, reminder: &Reminder) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reminders (
                id, user_id, event_id, scheduled_for, status, attempt_count,
                max_attempts, claimed_at, delivered_at, last_error, delivery_note, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reminder.id)
        .bind(&reminder.user_id)
        .bind(&reminder.event_id)
        .bind(reminder.scheduled_for)
        .bind(reminder.status)
        .bind(reminder.attempt_count)
        .bind(reminder.max_attempts)
        .bind(reminder.claimed_at)
        .bind(reminder.delivered_at)
        .bind(&reminder.last_error)
        .bind(&reminder.delivery_note)
        .bind(reminder.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claim up to `limit` due reminders.
    ///
    /// The select-and-flip happens in one statement, so concurrent
    /// dispatcher processes always claim disjoint sets.
    pub async fn claim_due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reminder>, AppError> {
        let claimed = sqlx::query_as::<_, Reminder>(
            r#"
            UPDATE reminders
            SET status = 'in_progress', claimed_at = ?1
            WHERE id IN (
                SELECT id FROM reminders
                WHERE status = 'pending' AND scheduled_for <= ?1
                ORDER BY scheduled_for ASC
                LIMIT ?2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }

    /// Finalize a claimed reminder as delivered.
    ///
    /// Conditional on the claim still being held; 0 rows means the
    /// claim was lost to a racing worker.
    pub async fn finalize_reminder_delivered(
        &self,
        id: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET status = 'done', delivered_at = ?, delivery_note = ?, claimed_at = NULL
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(now)
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ClaimLost);
        }
        Ok(())
    }

    /// Record a failed reminder attempt: requeue to pending until the
    /// attempt budget is exhausted, then mark terminally failed.
    pub async fn fail_reminder_attempt(
        &self,
        id: &str,
        error: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = ?,
                claimed_at = NULL
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ClaimLost);
        }
        Ok(())
    }

    // =========================================================================
    // Export jobs
    // =========================================================================

    /// Insert a pending export job for a user.
    pub async fn insert_export_job(&self, job: &ExportJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO export_jobs (
                id, user_id, status, requested_at, claimed_at, attempt_count,
                max_retries, output_path, last_error, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(job.status)
        .bind(job.requested_at)
        .bind(job.claimed_at)
        .bind(job.attempt_count)
        .bind(job.max_retries)
        .bind(&job.output_path)
        .bind(&job.last_error)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a single export job.
    pub async fn get_export_job(&self, id: &str) -> Result<Option<ExportJob>, AppError> {
        let job = sqlx::query_as::<_, ExportJob>("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Atomically claim up to `limit` pending export jobs.
    pub async fn claim_export_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExportJob>, AppError> {
        let claimed = sqlx::query_as::<_, ExportJob>(
            r#"
            UPDATE export_jobs
            SET status = 'in_progress', claimed_at = ?1
            WHERE id IN (
                SELECT id FROM export_jobs
                WHERE status = 'pending'
                ORDER BY requested_at ASC
                LIMIT ?2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }

    /// Finalize a claimed export as done, conditional on the claim.
    pub async fn finalize_export_done(
        &self,
        id: &str,
        output_path: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'done', output_path = ?, completed_at = ?, claimed_at = NULL
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(output_path)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ClaimLost);
        }
        Ok(())
    }

    /// Record a failed export attempt, conditional on the claim.
    pub async fn fail_export_attempt(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 > max_retries THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempt_count + 1 > max_retries THEN ?2 ELSE NULL END,
                last_error = ?1,
                claimed_at = NULL
            WHERE id = ?3 AND status = 'in_progress'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ClaimLost);
        }
        Ok(())
    }

    /// Reclaim exports abandoned mid-flight (stuck-job reaper).
    ///
    /// Items in progress since before `cutoff` are requeued while they
    /// have retries left, otherwise marked terminally failed.
    /// Returns (requeued, failed) counts.
    pub async fn reap_stuck_exports(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(u64, u64), AppError> {
        let requeued = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'pending', claimed_at = NULL,
                attempt_count = attempt_count + 1,
                last_error = 'abandoned in progress; reclaimed'
            WHERE status = 'in_progress' AND claimed_at <= ? AND attempt_count < max_retries
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'failed', claimed_at = NULL, completed_at = ?,
                last_error = 'abandoned in progress; retries exhausted'
            WHERE status = 'in_progress' AND claimed_at <= ? AND attempt_count >= max_retries
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok((requeued, failed))
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Insert an in-app notification row.
    pub async fn insert_notification(&self, notification: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, kind, title, body, context_url, data, read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.kind)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.context_url)
        .bind(&notification.data)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Notifications for a user, newest first (tests and admin).
    pub async fn notifications_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Notification>, AppError> {
        let rows = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
