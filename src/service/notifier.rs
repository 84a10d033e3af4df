//! In-app notifications
//!
//! The reminder dispatcher treats notification creation as a required
//! side effect, so the store-backed implementation surfaces its errors
//! instead of swallowing them.

use chrono::Utc;
use futures::future::BoxFuture;

use crate::data::{Database, EntityId, Notification};
use crate::error::AppError;

/// Creates in-app notifications for local users.
pub trait Notifier: Send + Sync {
    fn create<'a>(
        &'a self,
        user_id: &'a str,
        kind: &'a str,
        title: &'a str,
        body: &'a str,
        context_url: Option<&'a str>,
        data: Option<serde_json::Value>,
    ) -> BoxFuture<'a, Result<(), AppError>>;
}

/// Store-backed notifier.
#[derive(Clone)]
pub struct DbNotifier {
    db: Database,
}

impl DbNotifier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl Notifier for DbNotifier {
    fn create<'a>(
        &'a self,
        user_id: &'a str,
        kind: &'a str,
        title: &'a str,
        body: &'a str,
        context_url: Option<&'a str>,
        data: Option<serde_json::Value>,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move {
            let data = match data {
                Some(value) => {
                    Some(serde_json::to_string(&value).map_err(|e| AppError::Internal(e.into()))?)
                }
                None => None,
            };

            self.db
                .insert_notification(&Notification {
                    id: EntityId::new().0,
                    user_id: user_id.to_string(),
                    kind: kind.to_string(),
                    title: title.to_string(),
                    body: body.to_string(),
                    context_url: context_url.map(String::from),
                    data,
                    read: false,
                    created_at: Utc::now(),
                })
                .await
        })
    }
}
