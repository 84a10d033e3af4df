//! Outbound activity delivery
//!
//! Orchestrates signing, fetching, and retry for one or many remote
//! inboxes. Fan-out is concurrent with settle-all semantics: every
//! inbox gets its attempt regardless of how the others fare. Exhausted
//! deliveries land in the dead-letter queue for scheduled re-attempts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::config::FederationConfig;
use crate::data::{ActorIdentity, Database};
use crate::error::AppError;
use crate::metrics;

use super::audience::{Addressing, AudienceResolver};
use super::dead_letter;
use super::fetch::SafeFetch;
use super::signer::{sign_request, KeyStore};

// =============================================================================
// Outbound payloads and failure classification
// =============================================================================

/// A signed JSON activity ready for delivery.
///
/// Immutable once constructed; the engine never mutates the payload.
#[derive(Debug, Clone)]
pub struct OutboundActivity {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl OutboundActivity {
    /// Wrap a JSON activity, lifting its `id` and `type` fields.
    pub fn new(payload: serde_json::Value) -> Result<Self, AppError> {
        let id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("Activity missing id".to_string()))?
            .to_string();
        let kind = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("Activity missing type".to_string()))?
            .to_string();
        Ok(Self { id, kind, payload })
    }

    /// Serialized request body.
    pub fn body(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(&self.payload).map_err(|e| AppError::Internal(e.into()))
    }
}

/// Why one delivery attempt failed.
///
/// Configuration failures (missing or undecryptable key) are terminal
/// and skip retry; everything else is transient and eligible for
/// backoff.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub message: String,
    pub code: &'static str,
    pub status_code: Option<u16>,
}

impl DeliveryFailure {
    pub const NO_PRIVATE_KEY: &'static str = "no_private_key";
    pub const DECRYPTION_FAILED: &'static str = "decryption_failed";
    pub const SIGNING_ERROR: &'static str = "signing_error";
    pub const NETWORK_ERROR: &'static str = "network_error";
    pub const HTTP_ERROR: &'static str = "http_error";

    fn new(code: &'static str, message: String) -> Self {
        Self {
            message,
            code,
            status_code: None,
        }
    }

    fn http(status: u16) -> Self {
        Self {
            message: format!("Remote inbox returned HTTP {}", status),
            code: Self::HTTP_ERROR,
            status_code: Some(status),
        }
    }

    /// Configuration failures never retry.
    pub fn is_config_error(&self) -> bool {
        matches!(self.code, Self::NO_PRIVATE_KEY | Self::DECRYPTION_FAILED)
    }
}

/// Aggregate outcome of a fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

// =============================================================================
// Delivery engine
// =============================================================================

/// Signs and delivers activities to remote inboxes.
///
/// Cheap to clone; all fields are handles.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Database,
    fetcher: Arc<dyn SafeFetch>,
    keys: KeyStore,
    audience: AudienceResolver,
    max_retries: u32,
    retry_base_delay: Duration,
    max_concurrent: usize,
}

impl DeliveryEngine {
    pub fn new(
        db: Database,
        fetcher: Arc<dyn SafeFetch>,
        keys: KeyStore,
        audience: AudienceResolver,
        config: &FederationConfig,
    ) -> Self {
        Self {
            db,
            fetcher,
            keys,
            audience,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_concurrent: config.max_concurrent_deliveries,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// One signed POST to one inbox, no retry.
    ///
    /// Non-2xx responses and transport errors both come back as a
    /// classified `DeliveryFailure`.
    pub(crate) async fn try_deliver_once(
        &self,
        activity: &OutboundActivity,
        inbox_url: &str,
        identity: &ActorIdentity,
    ) -> Result<(), DeliveryFailure> {
        let encrypted = identity.encrypted_private_key.as_deref().ok_or_else(|| {
            DeliveryFailure::new(
                DeliveryFailure::NO_PRIVATE_KEY,
                format!("Actor {} has no private key", identity.actor_url),
            )
        })?;

        let pem = self.keys.decrypt(encrypted).map_err(|e| {
            DeliveryFailure::new(
                DeliveryFailure::DECRYPTION_FAILED,
                format!("Failed to decrypt private key: {}", e),
            )
        })?;

        let body = activity
            .body()
            .map_err(|e| DeliveryFailure::new(DeliveryFailure::SIGNING_ERROR, e.to_string()))?;

        let headers = sign_request("POST", inbox_url, &body, &pem, &identity.key_id())
            .map_err(|e| DeliveryFailure::new(DeliveryFailure::SIGNING_ERROR, e.to_string()))?;

        let started = Instant::now();
        let response = self
            .fetcher
            .post(inbox_url, &headers.as_pairs(), body)
            .await
            .map_err(|e| {
                metrics::observe_delivery("network_error", started.elapsed());
                DeliveryFailure::new(DeliveryFailure::NETWORK_ERROR, e.to_string())
            })?;

        if response.is_success() {
            metrics::observe_delivery("success", started.elapsed());
            Ok(())
        } else {
            metrics::observe_delivery("http_error", started.elapsed());
            Err(DeliveryFailure::http(response.status))
        }
    }

    /// Record a failure in the dead-letter queue, never escalating.
    async fn record_failure(
        &self,
        activity: &OutboundActivity,
        inbox_url: &str,
        user_id: &str,
        attempt_count: i64,
        failure: &DeliveryFailure,
    ) {
        let result = dead_letter::record_failure(
            &self.db,
            activity,
            inbox_url,
            user_id,
            attempt_count,
            failure,
            self.max_retries as i64,
        )
        .await;

        if let Err(e) = result {
            tracing::error!(
                activity_id = %activity.id,
                inbox_url = %inbox_url,
                error = %e,
                "Failed to persist dead-letter record"
            );
        }
    }

    /// Sign and deliver one activity to one inbox.
    ///
    /// Configuration failures skip retry entirely and, when
    /// `record_failure` is set, land in the dead-letter queue at
    /// attempt count zero. Transient failures take the same path.
    ///
    /// # Returns
    /// `true` on a 2xx response, `false` on any failure.
    pub async fn sign_and_deliver(
        &self,
        activity: &OutboundActivity,
        inbox_url: &str,
        identity: &ActorIdentity,
        record_failure: bool,
    ) -> bool {
        match self.try_deliver_once(activity, inbox_url, identity).await {
            Ok(()) => {
                tracing::debug!(
                    activity_id = %activity.id,
                    inbox_url = %inbox_url,
                    "Delivered activity"
                );
                true
            }
            Err(failure) => {
                tracing::warn!(
                    activity_id = %activity.id,
                    inbox_url = %inbox_url,
                    code = failure.code,
                    status = ?failure.status_code,
                    error = %failure.message,
                    "Delivery failed"
                );
                if record_failure {
                    self.record_failure(activity, inbox_url, &identity.user_id, 0, &failure)
                        .await;
                }
                false
            }
        }
    }

    /// Deliver with exponential backoff between attempts.
    ///
    /// Sleeps `2^attempt` times the configured base delay after each
    /// failed attempt (1s, 2s, 4s, ... at the default base). On
    /// exhaustion the delivery is dead-lettered with the full attempt
    /// count, which marks it terminally failed right away.
    pub async fn deliver_with_retry(
        &self,
        activity: &OutboundActivity,
        inbox_url: &str,
        identity: &ActorIdentity,
    ) -> bool {
        let mut last_failure = None;

        for attempt in 0..self.max_retries {
            match self.try_deliver_once(activity, inbox_url, identity).await {
                Ok(()) => {
                    tracing::debug!(
                        activity_id = %activity.id,
                        inbox_url = %inbox_url,
                        attempt,
                        "Delivered activity"
                    );
                    return true;
                }
                Err(failure) => {
                    tracing::warn!(
                        activity_id = %activity.id,
                        inbox_url = %inbox_url,
                        attempt,
                        code = failure.code,
                        error = %failure.message,
                        "Delivery attempt failed"
                    );

                    if failure.is_config_error() {
                        self.record_failure(activity, inbox_url, &identity.user_id, 0, &failure)
                            .await;
                        return false;
                    }

                    let is_last = attempt + 1 == self.max_retries;
                    last_failure = Some(failure);
                    if !is_last {
                        tokio::time::sleep(self.retry_base_delay * (1u32 << attempt)).await;
                    }
                }
            }
        }

        if let Some(failure) = last_failure {
            self.record_failure(
                activity,
                inbox_url,
                &identity.user_id,
                self.max_retries as i64,
                &failure,
            )
            .await;
        }
        false
    }

    /// Concurrent fan-out to a set of inboxes.
    ///
    /// Inbox URLs are deduplicated first; each unique inbox gets
    /// exactly one delivery attempt (or retry sequence). Failures are
    /// isolated per inbox and collected into the report.
    pub async fn deliver_to_inboxes(
        &self,
        activity: Arc<OutboundActivity>,
        inbox_urls: &[String],
        identity: &ActorIdentity,
        use_retry: bool,
    ) -> DeliveryReport {
        let mut seen = HashSet::new();
        let unique: Vec<String> = inbox_urls
            .iter()
            .filter(|url| seen.insert(url.as_str()))
            .cloned()
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(unique.len());

        for inbox_url in unique {
            let engine = self.clone();
            let activity = Arc::clone(&activity);
            let identity = identity.clone();
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                // Closed only on runtime shutdown; treat as failure.
                let Ok(_permit) = semaphore.acquire().await else {
                    return false;
                };
                if use_retry {
                    engine
                        .deliver_with_retry(&activity, &inbox_url, &identity)
                        .await
                } else {
                    engine
                        .sign_and_deliver(&activity, &inbox_url, &identity, true)
                        .await
                }
            }));
        }

        let mut report = DeliveryReport::default();
        for handle in handles {
            report.attempted += 1;
            match handle.await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Delivery task panicked");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            activity_id = %activity.id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Delivery fan-out complete"
        );
        report
    }

    /// Deliver to every accepted follower of a user.
    pub async fn deliver_to_followers(
        &self,
        activity: Arc<OutboundActivity>,
        user_id: &str,
        use_retry: bool,
    ) -> Result<DeliveryReport, AppError> {
        let identity = self.db.identity_for_user(user_id).await?;
        let inboxes = self.audience.follower_inboxes(user_id).await?;
        Ok(self
            .deliver_to_inboxes(activity, &inboxes, &identity, use_retry)
            .await)
    }

    /// Deliver to an explicit list of actor URLs.
    ///
    /// Local and unknown actors are skipped during resolution.
    pub async fn deliver_to_actors(
        &self,
        activity: Arc<OutboundActivity>,
        actor_urls: &[String],
        user_id: &str,
        use_retry: bool,
    ) -> Result<DeliveryReport, AppError> {
        let identity = self.db.identity_for_user(user_id).await?;
        let addressing = Addressing {
            to: actor_urls.to_vec(),
            ..Default::default()
        };
        let inboxes = self.audience.resolve(&identity, &addressing).await?;
        Ok(self
            .deliver_to_inboxes(activity, &inboxes, &identity, use_retry)
            .await)
    }

    /// Deliver according to a full `{to, cc, bcc}` addressing block.
    pub async fn deliver_activity(
        &self,
        activity: Arc<OutboundActivity>,
        user_id: &str,
        addressing: &Addressing,
        use_retry: bool,
    ) -> Result<DeliveryReport, AppError> {
        let identity = self.db.identity_for_user(user_id).await?;
        let inboxes = self.audience.resolve(&identity, addressing).await?;
        Ok(self
            .deliver_to_inboxes(activity, &inboxes, &identity, use_retry)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_activity_lifts_id_and_type() {
        let activity = OutboundActivity::new(json!({
            "id": "https://local.example/activities/1",
            "type": "Like",
            "actor": "https://local.example/users/alice",
        }))
        .unwrap();
        assert_eq!(activity.id, "https://local.example/activities/1");
        assert_eq!(activity.kind, "Like");
    }

    #[test]
    fn outbound_activity_rejects_missing_fields() {
        assert!(OutboundActivity::new(json!({"type": "Like"})).is_err());
        assert!(OutboundActivity::new(json!({"id": "x"})).is_err());
    }

    #[test]
    fn config_failures_are_classified_terminal() {
        let no_key = DeliveryFailure::new(DeliveryFailure::NO_PRIVATE_KEY, String::new());
        let decrypt = DeliveryFailure::new(DeliveryFailure::DECRYPTION_FAILED, String::new());
        let http = DeliveryFailure::http(502);

        assert!(no_key.is_config_error());
        assert!(decrypt.is_config_error());
        assert!(!http.is_config_error());
        assert_eq!(http.status_code, Some(502));
    }
}
