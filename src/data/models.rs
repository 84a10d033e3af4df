//! Data models
//!
//! Rust structs representing database entities used by the delivery
//! engine and job dispatchers. All models use ULID for IDs and chrono
//! for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Users / actor identities
// =============================================================================

/// A local user able to publish signed activities
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    /// Contact address for reminder emails; `None` means no email delivery
    pub email: Option<String>,
    /// ActivityPub actor URL (globally unique)
    pub actor_url: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key, AES-256-GCM encrypted at rest.
    /// `None` for accounts that cannot sign (e.g. imported shells).
    pub encrypted_private_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the delivery engine needs to sign on behalf of a user
#[derive(Debug, Clone)]
pub struct ActorIdentity {
    pub user_id: String,
    pub actor_url: String,
    pub encrypted_private_key: Option<String>,
}

impl ActorIdentity {
    /// Key ID advertised in outbound signatures
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_url)
    }

    /// Followers collection URL for this actor
    pub fn followers_url(&self) -> String {
        format!("{}/followers", self.actor_url)
    }
}

impl User {
    pub fn identity(&self) -> ActorIdentity {
        ActorIdentity {
            user_id: self.id.clone(),
            actor_url: self.actor_url.clone(),
            encrypted_private_key: self.encrypted_private_key.clone(),
        }
    }
}

// =============================================================================
// Followers / peer actors
// =============================================================================

/// A remote actor following one of our users
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub id: String,
    pub user_id: String,
    pub actor_url: String,
    pub inbox_url: String,
    /// Shared inbox serving many actors on the same server, preferred
    /// over the personal inbox when present
    pub shared_inbox_url: Option<String>,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

impl Follower {
    /// Inbox URL to actually deliver to (shared inbox wins)
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_url.as_deref().unwrap_or(&self.inbox_url)
    }
}

/// Cached remote actor record (actor directory entry)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PeerActor {
    pub actor_url: String,
    pub inbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Dead-letter queue
// =============================================================================

/// Status of a dead-lettered delivery.
///
/// Transitions only move forward:
/// `Pending -> Retrying -> {deleted | Pending | Failed}` or
/// `any -> Discarded`; a status never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Failed,
    Discarded,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }

    /// Terminal statuses accept no further automatic retries
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Discarded)
    }
}

/// A delivery that exhausted its immediate retries, persisted for
/// scheduled re-attempts or operator action
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedDelivery {
    pub id: String,
    pub activity_id: String,
    pub activity_type: String,
    /// Snapshot of the signed activity payload (JSON)
    pub activity: String,
    pub inbox_url: String,
    pub user_id: String,
    pub status: DeliveryStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Remote instances
// =============================================================================

/// A known remote peer server, created on first sighting
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub domain: String,
    pub base_url: String,
    /// Discovered public activity stream endpoint; `None` until discovery
    pub public_events_url: Option<String>,
    /// Pagination cursor into the public stream
    pub last_page_url: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
}

/// An activity pulled from a remote public stream
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActivity {
    pub id: String,
    pub activity_id: String,
    pub actor_url: String,
    pub instance_domain: String,
    pub activity: String,
    pub fetched_at: DateTime<Utc>,
}

// =============================================================================
// Events and scheduled job items
// =============================================================================

/// A published event (only the fields the job engine needs)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub attendance_count: i64,
    pub like_count: i64,
    pub popularity_score: i64,
    pub created_at: DateTime<Utc>,
}

/// Status of a scheduled job item (reminders, exports).
///
/// At most one dispatcher process holds a claim (`InProgress`) on an
/// item at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// An event reminder scheduled for delivery to its owner
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub event_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Non-fatal notes recorded during delivery (e.g. email send failure)
    pub delivery_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user data-export request
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExportJob {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub requested_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempt_count: i64,
    pub max_retries: i64,
    pub output_path: Option<String>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Notifications
// =============================================================================

/// In-app notification row created by the reminder dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub context_url: Option<String>,
    /// Extra payload (JSON)
    pub data: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
