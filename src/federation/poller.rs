//! Remote instance poller
//!
//! Discovers public activity streams on known peer servers and pulls
//! them page by page, caching each activity locally. Instances that do
//! not expose a public stream fall back to a best-effort poll of a
//! handful of well-known actor outboxes.
//!
//! The cursor is persisted before page items are acted on, so a crash
//! mid-page re-fetches at most one page and never skips one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};

use crate::config::PollerConfig;
use crate::data::{Database, Instance, PeerActor};
use crate::error::AppError;
use crate::jobs::JobCycle;
use crate::metrics;

use super::fetch::SafeFetch;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Candidate public-stream endpoints probed during discovery.
const DISCOVERY_PATHS: &[&str] = &["/federation/events", "/public/outbox", "/outbox"];

/// Actor names probed in fallback mode when discovery finds nothing.
const WELL_KNOWN_ACTORS: &[&str] = &["events", "announcements", "admin"];

/// Items and next-page token lifted from a collection page.
///
/// Handles both `OrderedCollection` (`orderedItems`) and plain
/// `Collection` (`items`) shapes; `next` may be a bare URL string or
/// an embedded page object carrying an `id`.
fn parse_collection(page: &serde_json::Value) -> (Vec<serde_json::Value>, Option<String>) {
    let items = page
        .get("orderedItems")
        .or_else(|| page.get("items"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let next = page.get("next").and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(_) => v.get("id").and_then(|id| id.as_str()).map(String::from),
        _ => None,
    });

    (items, next)
}

/// Actor URL implied by an outbox endpoint, if any.
fn endpoint_actor(endpoint: &str) -> Option<String> {
    endpoint
        .strip_suffix("/outbox")
        .map(|actor| actor.to_string())
}

/// Actor to attribute a fetched activity to.
///
/// Preference order: the activity's own `actor` field, then the actor
/// implied by the endpoint, then the instance base URL.
fn attributed_actor(item: &serde_json::Value, endpoint: &str, base_url: &str) -> String {
    let from_item = match item.get("actor") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Object(obj)) => {
            obj.get("id").and_then(|id| id.as_str()).map(String::from)
        }
        _ => None,
    };

    from_item
        .or_else(|| endpoint_actor(endpoint))
        .unwrap_or_else(|| base_url.to_string())
}

/// Pulls remote public activity streams on a schedule.
#[derive(Clone)]
pub struct InstancePoller {
    db: Database,
    fetcher: Arc<dyn SafeFetch>,
    staleness: Duration,
    batch_size: u32,
    sub_batch_size: usize,
}

impl InstancePoller {
    pub fn new(db: Database, fetcher: Arc<dyn SafeFetch>, config: &PollerConfig) -> Self {
        Self {
            db,
            fetcher,
            staleness: Duration::from_secs(config.interval_seconds),
            batch_size: config.batch_size,
            sub_batch_size: config.sub_batch_size,
        }
    }

    /// One poll cycle over due instances.
    ///
    /// Instances are processed in fixed-size concurrent sub-batches;
    /// each instance's errors stay on its own row.
    pub async fn poll_cycle(&self) -> Result<(), AppError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.staleness)
                .map_err(|e| AppError::Config(format!("Invalid poll interval: {}", e)))?;
        let due = self.db.due_instances(cutoff, self.batch_size).await?;
        if due.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = due.len(), "Polling due instances");
        for chunk in due.chunks(self.sub_batch_size.max(1)) {
            join_all(chunk.iter().map(|instance| self.poll_instance(instance))).await;
        }
        Ok(())
    }

    /// Poll one instance, recording any failure on its row.
    async fn poll_instance(&self, instance: &Instance) {
        match self.poll_instance_inner(instance).await {
            Ok(cached) => {
                metrics::INSTANCE_POLLS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                tracing::debug!(domain = %instance.domain, cached, "Polled instance");
            }
            Err(e) => {
                metrics::INSTANCE_POLLS_TOTAL
                    .with_label_values(&["failure"])
                    .inc();
                tracing::warn!(domain = %instance.domain, error = %e, "Instance poll failed");
                let recorded = self
                    .db
                    .record_instance_error(&instance.domain, &e.to_string(), Utc::now())
                    .await;
                if let Err(e) = recorded {
                    tracing::error!(domain = %instance.domain, error = %e, "Failed to record instance error");
                }
            }
        }
    }

    async fn poll_instance_inner(&self, instance: &Instance) -> Result<usize, AppError> {
        let endpoint = match &instance.public_events_url {
            Some(url) => url.clone(),
            None => match self.discover_public_endpoint(instance).await? {
                Some(url) => url,
                None => {
                    // Best-effort mode: no shared cursor, each outbox
                    // is fetched from its first page every cycle.
                    let cached = self.poll_well_known_actors(instance).await;
                    self.db
                        .record_instance_fetched(&instance.domain, Utc::now())
                        .await?;
                    return Ok(cached);
                }
            },
        };

        let page_url = instance.last_page_url.clone().unwrap_or_else(|| endpoint.clone());
        self.fetch_stream_page(instance, &endpoint, &page_url).await
    }

    /// Probe the discovery paths; persist the first hit immediately.
    async fn discover_public_endpoint(
        &self,
        instance: &Instance,
    ) -> Result<Option<String>, AppError> {
        for path in DISCOVERY_PATHS {
            let candidate = format!("{}{}", instance.base_url.trim_end_matches('/'), path);
            let response = match self.fetcher.get(&candidate, ACTIVITY_JSON).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(domain = %instance.domain, url = %candidate, error = %e, "Discovery probe failed");
                    continue;
                }
            };
            if !response.is_success() {
                continue;
            }
            let Ok(page) = response.json() else { continue };
            if page.get("orderedItems").is_some()
                || page.get("items").is_some()
                || page.get("first").is_some()
            {
                self.db
                    .set_public_events_url(&instance.domain, &candidate)
                    .await?;
                tracing::info!(domain = %instance.domain, url = %candidate, "Discovered public events endpoint");
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Fetch one stream page and cache its activities.
    ///
    /// The cursor advances (or the fetch is recorded as complete)
    /// before any item is cached.
    async fn fetch_stream_page(
        &self,
        instance: &Instance,
        endpoint: &str,
        page_url: &str,
    ) -> Result<usize, AppError> {
        let page = self.fetch_collection_page(page_url).await?;
        let (items, next) = parse_collection(&page);

        let now = Utc::now();
        match next {
            Some(cursor) => {
                self.db
                    .advance_instance_cursor(&instance.domain, &cursor, now)
                    .await?;
            }
            None => {
                self.db
                    .record_instance_fetched(&instance.domain, now)
                    .await?;
            }
        }

        self.cache_items(instance, endpoint, &items, "stream", now)
            .await
    }

    /// Fetch one outbox page in fallback mode.
    ///
    /// The instance row's cursor belongs to the shared public stream;
    /// fallback polling never writes it. Any `next` token is dropped
    /// and the outbox starts from its first page every cycle.
    async fn fetch_outbox_page(
        &self,
        instance: &Instance,
        outbox: &str,
    ) -> Result<usize, AppError> {
        let page = self.fetch_collection_page(outbox).await?;
        let (items, _next) = parse_collection(&page);
        self.cache_items(instance, outbox, &items, "fallback", Utc::now())
            .await
    }

    async fn fetch_collection_page(&self, url: &str) -> Result<serde_json::Value, AppError> {
        let response = self.fetcher.get(url, ACTIVITY_JSON).await?;
        if !response.is_success() {
            return Err(AppError::Federation(format!(
                "Public stream fetch returned HTTP {}",
                response.status
            )));
        }
        response.json()
    }

    async fn cache_items(
        &self,
        instance: &Instance,
        endpoint: &str,
        items: &[serde_json::Value],
        mode: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut cached = 0;
        for item in items {
            let Some(activity_id) = item.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let actor = attributed_actor(item, endpoint, &instance.base_url);
            let payload =
                serde_json::to_string(item).map_err(|e| AppError::Internal(e.into()))?;
            if self
                .db
                .cache_remote_activity(activity_id, &actor, &instance.domain, &payload, now)
                .await?
            {
                cached += 1;
                metrics::REMOTE_ACTIVITIES_CACHED
                    .with_label_values(&[mode])
                    .inc();
            }
        }
        Ok(cached)
    }

    /// Fallback: poll well-known actor outboxes individually.
    ///
    /// Per-actor failures are logged and skipped.
    async fn poll_well_known_actors(&self, instance: &Instance) -> usize {
        let base = instance.base_url.trim_end_matches('/');
        let mut cached = 0;
        for name in WELL_KNOWN_ACTORS {
            let outbox = format!("{}/users/{}/outbox", base, name);
            match self.fetch_outbox_page(instance, &outbox).await {
                Ok(n) => cached += n,
                Err(e) => {
                    tracing::debug!(domain = %instance.domain, outbox = %outbox, error = %e, "Well-known actor poll failed");
                }
            }
        }
        cached
    }

    /// Administrative hard refresh of one instance.
    ///
    /// Clears the cursor, refreshes cached peer actor profiles for the
    /// domain, and polls immediately.
    pub async fn refresh_instance(&self, domain: &str) -> Result<(), AppError> {
        let instance = self.db.get_instance(domain).await?.ok_or(AppError::NotFound)?;
        self.db.reset_instance_cursor(domain).await?;
        self.refresh_peer_profiles(domain).await?;

        let mut instance = instance;
        instance.last_page_url = None;
        self.poll_instance(&instance).await;
        Ok(())
    }

    /// Re-fetch cached actor documents for a domain, best effort.
    async fn refresh_peer_profiles(&self, domain: &str) -> Result<(), AppError> {
        let peers = self.db.peer_actors_for_domain(domain).await?;
        for peer in peers {
            match self.fetch_actor_profile(&peer.actor_url).await {
                Ok(Some(updated)) => {
                    if let Err(e) = self.db.upsert_peer_actor(&updated).await {
                        tracing::warn!(actor_url = %peer.actor_url, error = %e, "Failed to store refreshed peer actor");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(actor_url = %peer.actor_url, error = %e, "Peer profile refresh failed");
                }
            }
        }
        Ok(())
    }

    async fn fetch_actor_profile(&self, actor_url: &str) -> Result<Option<PeerActor>, AppError> {
        let response = self.fetcher.get(actor_url, ACTIVITY_JSON).await?;
        if !response.is_success() {
            return Ok(None);
        }
        let doc = response.json()?;

        let inbox_url = doc
            .get("inbox")
            .and_then(|v| v.as_str())
            .map(String::from);
        let shared_inbox_url = doc
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Some(PeerActor {
            actor_url: actor_url.to_string(),
            inbox_url,
            shared_inbox_url,
            updated_at: Utc::now(),
        }))
    }
}

impl JobCycle for InstancePoller {
    fn name(&self) -> &'static str {
        "instance_poller"
    }

    fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(self.poll_cycle())
    }
}
