//! Shared test harness
//!
//! Builds an application state on a temporary SQLite file with a
//! recording fake in place of the outbound HTTP client, plus seeding
//! helpers for users, followers, and activities.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tempfile::TempDir;

use rallypoint::config::{
    AppConfig, DatabaseConfig, FederationConfig, JobsConfig, KeysConfig, LoggingConfig,
    PollerConfig, ServerConfig,
};
use rallypoint::data::{Database, Follower, User};
use rallypoint::error::AppError;
use rallypoint::federation::{FetchResponse, KeyStore, OutboundActivity, SafeFetch};
use rallypoint::AppState;

pub const TEST_SECRET: &str = "test-secret-key-32-bytes-long!!!";

// =============================================================================
// Recording fetcher
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedPost {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

enum FailureMode {
    Network,
    Status(u16),
}

/// Fake outbound HTTP client.
///
/// Records every POST and answers 202 unless a failure mode has been
/// programmed for the URL. GETs answer from a canned body map.
#[derive(Default)]
pub struct RecordingFetcher {
    posts: Mutex<Vec<RecordedPost>>,
    post_failures: Mutex<HashMap<String, FailureMode>>,
    get_bodies: Mutex<HashMap<String, Vec<u8>>>,
}

impl RecordingFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with_network(&self, url: &str) {
        self.post_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), FailureMode::Network);
    }

    pub fn fail_with_status(&self, url: &str, status: u16) {
        self.post_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), FailureMode::Status(status));
    }

    pub fn clear_failure(&self, url: &str) {
        self.post_failures.lock().unwrap().remove(url);
    }

    pub fn respond_to_get(&self, url: &str, body: serde_json::Value) {
        self.get_bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string().into_bytes());
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub fn posts_to(&self, url: &str) -> usize {
        self.posts.lock().unwrap().iter().filter(|p| p.url == url).count()
    }

    pub fn recorded_posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }
}

impl SafeFetch for RecordingFetcher {
    fn post<'a>(
        &'a self,
        url: &'a str,
        headers: &'a [(String, String)],
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
        Box::pin(async move {
            self.posts.lock().unwrap().push(RecordedPost {
                url: url.to_string(),
                headers: headers.to_vec(),
                body,
            });

            match self.post_failures.lock().unwrap().get(url) {
                Some(FailureMode::Network) => Err(AppError::Federation(
                    "simulated connection refused".to_string(),
                )),
                Some(FailureMode::Status(status)) => Ok(FetchResponse {
                    status: *status,
                    body: Vec::new(),
                }),
                None => Ok(FetchResponse {
                    status: 202,
                    body: Vec::new(),
                }),
            }
        })
    }

    fn get<'a>(
        &'a self,
        url: &'a str,
        _accept: &'a str,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
        Box::pin(async move {
            match self.get_bodies.lock().unwrap().get(url) {
                Some(body) => Ok(FetchResponse {
                    status: 200,
                    body: body.clone(),
                }),
                None => Ok(FetchResponse {
                    status: 404,
                    body: Vec::new(),
                }),
            }
        })
    }
}

// =============================================================================
// Application harness
// =============================================================================

pub struct TestApp {
    pub state: AppState,
    pub fetcher: Arc<RecordingFetcher>,
    _temp_dir: TempDir,
}

impl TestApp {
    pub fn db(&self) -> &Database {
        &self.state.db
    }
}

pub fn test_config(temp_dir: &TempDir) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        federation: FederationConfig {
            max_retries: 3,
            // Short backoff keeps the retry-exhaustion tests fast.
            retry_base_delay_ms: 25,
            dlq_sweep_interval_seconds: 60,
            dlq_select_limit: 100,
            dlq_process_limit: 50,
            max_concurrent_deliveries: 10,
            request_timeout_seconds: 30,
        },
        poller: PollerConfig {
            interval_seconds: 600,
            batch_size: 20,
            sub_batch_size: 5,
        },
        jobs: JobsConfig {
            reminder_interval_seconds: 60,
            popularity_interval_seconds: 900,
            popularity_batch_size: 100,
            export_interval_seconds: 300,
            export_timeout_seconds: 600,
            export_dir: temp_dir.path().join("exports"),
            claim_batch_size: 25,
            shutdown_timeout_seconds: 30,
        },
        keys: KeysConfig {
            secret: TEST_SECRET.to_string(),
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

pub async fn spawn_app() -> TestApp {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let db = Database::connect(&config.database.path).await.unwrap();
    let fetcher = RecordingFetcher::new();
    let state = AppState::with_fetcher(config, db, fetcher.clone());

    TestApp {
        state,
        fetcher,
        _temp_dir: temp_dir,
    }
}

// =============================================================================
// Seeding helpers
// =============================================================================

fn generate_private_key_pem() -> String {
    let mut rng = rand::thread_rng();
    // Small keys keep the tests fast; size is irrelevant to behavior.
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
    private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("private key pem")
        .to_string()
}

/// Insert a signing-capable local user.
pub async fn seed_user(db: &Database, id: &str, username: &str) -> User {
    let pem = generate_private_key_pem();
    let encrypted = KeyStore::new(TEST_SECRET).encrypt(&pem).unwrap();
    let now = Utc::now();

    let user = User {
        id: id.to_string(),
        username: username.to_string(),
        email: Some(format!("{}@local.example", username)),
        actor_url: format!("https://local.example/users/{}", username),
        public_key_pem: "unused in tests".to_string(),
        encrypted_private_key: Some(encrypted),
        created_at: now,
        updated_at: now,
    };
    db.upsert_user(&user).await.unwrap();
    user
}

/// Insert a local user that cannot sign.
pub async fn seed_keyless_user(db: &Database, id: &str, username: &str) -> User {
    let now = Utc::now();
    let user = User {
        id: id.to_string(),
        username: username.to_string(),
        email: None,
        actor_url: format!("https://local.example/users/{}", username),
        public_key_pem: "unused in tests".to_string(),
        encrypted_private_key: None,
        created_at: now,
        updated_at: now,
    };
    db.upsert_user(&user).await.unwrap();
    user
}

/// Insert an accepted follower with the given delivery inbox.
pub async fn seed_follower(db: &Database, user_id: &str, n: usize, shared_inbox: Option<&str>) {
    db.upsert_follower(&Follower {
        id: format!("follower-{n}"),
        user_id: user_id.to_string(),
        actor_url: format!("https://remote{n}.example/users/bob"),
        inbox_url: format!("https://remote{n}.example/users/bob/inbox"),
        shared_inbox_url: shared_inbox.map(String::from),
        accepted: true,
        created_at: Utc::now(),
    })
    .await
    .unwrap();
}

pub fn make_activity(id: &str) -> OutboundActivity {
    OutboundActivity::new(serde_json::json!({
        "id": format!("https://local.example/activities/{id}"),
        "type": "Like",
        "actor": "https://local.example/users/alice",
        "object": "https://remote1.example/events/1",
    }))
    .unwrap()
}
