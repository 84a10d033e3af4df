//! Rallypoint - federated event sharing, delivery and jobs engine
//!
//! The core of a federated event-sharing service: signed activity
//! delivery to remote peer servers with retry and a dead-letter queue,
//! remote instance polling, and scheduled background jobs with
//! crash-safe atomic claims.
//!
//! # Modules
//!
//! - `federation`: signing, delivery, dead-letter queue, instance poller
//! - `jobs`: dispatcher shape plus the reminder/popularity/export jobs
//! - `service`: notification and email collaborator interfaces
//! - `data`: SQLite persistence (sqlx)
//! - `api`: admin and metrics HTTP surface
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod jobs;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, response::Json, routing::get};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::data::Database;
use crate::error::AppError;
use crate::federation::{
    AudienceResolver, DeadLetterQueue, DeliveryEngine, InstancePoller, KeyStore, SafeFetch,
    SafeFetcher,
};
use crate::jobs::{
    Dispatcher, DispatcherSet, ExportDispatcher, PopularityRefresher, ReminderDispatcher,
};
use crate::service::{Mailer, Notifier};

/// Application state shared across handlers and dispatchers
///
/// Cloned per request; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Database handle (SQLite pool)
    pub db: Database,

    /// Outbound delivery engine
    pub engine: DeliveryEngine,

    /// Dead-letter queue (sweep + operator actions)
    pub dead_letters: DeadLetterQueue,

    /// Remote instance poller
    pub poller: InstancePoller,
}

impl AppState {
    /// Connect the database and wire up the full engine.
    pub async fn new(config: AppConfig) -> Result<Self, AppError> {
        let db = Database::connect(&config.database.path).await?;
        Self::with_database(config, db)
    }

    /// Build on an existing database connection.
    pub fn with_database(config: AppConfig, db: Database) -> Result<Self, AppError> {
        let fetcher: Arc<dyn SafeFetch> = Arc::new(SafeFetcher::new(Duration::from_secs(
            config.federation.request_timeout_seconds,
        ))?);
        Ok(Self::with_fetcher(config, db, fetcher))
    }

    /// Build with a caller-supplied fetcher (tests substitute fakes).
    pub fn with_fetcher(config: AppConfig, db: Database, fetcher: Arc<dyn SafeFetch>) -> Self {
        let keys = KeyStore::new(&config.keys.secret);
        let audience = AudienceResolver::new(db.clone(), config.server.base_url());
        let engine = DeliveryEngine::new(
            db.clone(),
            Arc::clone(&fetcher),
            keys,
            audience,
            &config.federation,
        );
        let dead_letters = DeadLetterQueue::new(
            db.clone(),
            engine.clone(),
            config.federation.dlq_select_limit,
            config.federation.dlq_process_limit,
        );
        let poller = InstancePoller::new(db.clone(), fetcher, &config.poller);

        Self {
            config: Arc::new(config),
            db,
            engine,
            dead_letters,
            poller,
        }
    }

    /// Assemble every periodic worker of the process.
    ///
    /// Dispatchers: reminders, popularity refresh, data export, the
    /// dead-letter sweep, and the instance poller.
    pub fn build_dispatchers(
        &self,
        notifier: Arc<dyn Notifier>,
        mailer: Arc<dyn Mailer>,
    ) -> DispatcherSet {
        let jobs = &self.config.jobs;

        let reminders = Dispatcher::new(
            Arc::new(ReminderDispatcher::new(
                self.db.clone(),
                notifier,
                mailer,
                jobs.claim_batch_size,
            )),
            Duration::from_secs(jobs.reminder_interval_seconds),
        );

        let popularity = Dispatcher::new(
            Arc::new(PopularityRefresher::new(
                self.db.clone(),
                jobs.popularity_batch_size,
            )),
            Duration::from_secs(jobs.popularity_interval_seconds),
        );

        let export = Dispatcher::new(
            Arc::new(ExportDispatcher::new(
                self.db.clone(),
                jobs.export_dir.clone(),
                Duration::from_secs(jobs.export_timeout_seconds),
                jobs.claim_batch_size,
            )),
            Duration::from_secs(jobs.export_interval_seconds),
        );

        let dead_letter_sweep = Dispatcher::new(
            Arc::new(self.dead_letters.clone()),
            Duration::from_secs(self.config.federation.dlq_sweep_interval_seconds),
        );

        let instance_poller = Dispatcher::new(
            Arc::new(self.poller.clone()),
            Duration::from_secs(self.config.poller.interval_seconds),
        );

        DispatcherSet::new(vec![
            reminders,
            popularity,
            export,
            dead_letter_sweep,
            instance_poller,
        ])
    }
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the HTTP router: health, metrics, admin.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(api::metrics_router())
        .nest("/api/admin", api::admin_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
