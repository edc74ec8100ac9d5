//! Common test utilities for E2E tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use axum::body::Bytes;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use openfirm::federation::{HttpTransport, actor::generate_rsa_keypair, sign_request};
use openfirm::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const ACTIVITY_JSON: &str = "application/activity+json";

static METRICS: Once = Once::new();

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

impl TestServer {
    /// Create a new test server instance with a local actor `alice`
    pub async fn new() -> Self {
        Self::with_policy(config::FollowPolicy::Manual).await
    }

    pub async fn with_policy(follow_policy: config::FollowPolicy) -> Self {
        METRICS.call_once(openfirm::metrics::init_metrics);

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so the public domain can carry the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            instance: config::InstanceConfig {
                title: "Test Instance".to_string(),
                description: "Test OpenFirm Instance".to_string(),
                contact_email: "test@example.com".to_string(),
                open_registrations: false,
            },
            federation: config::FederationConfig {
                follow_policy,
                clock_skew_seconds: 300,
                key_cache_ttl_seconds: 3600,
                actor_cache_ttl_seconds: 3600,
                request_timeout_seconds: 5,
                allow_private_addresses: true,
                user_agent: "OpenFirm-Test/0.1".to_string(),
            },
            delivery: config::DeliveryConfig {
                max_attempts: 3,
                base_backoff_seconds: 0,
                max_backoff_seconds: 0,
                concurrency: 4,
                batch_size: 50,
                poll_interval_seconds: 1,
            },
            actors: vec![config::LocalActorConfig {
                handle: "alice".to_string(),
                display_name: "Alice Recruiter".to_string(),
                bio: Some("Hiring Rust engineers".to_string()),
                avatar_url: None,
            }],
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let transport = HttpTransport::new(
            &config.federation.user_agent,
            config.federation.request_timeout(),
            true,
        )
        .unwrap();

        // Initialize app state with small keys to keep tests fast
        let state = AppState::build(config, Arc::new(transport), 1024)
            .await
            .unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = openfirm::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(state.delivery.clone().run(shutdown_rx));

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
            shutdown,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_iri(&self, handle: &str) -> String {
        self.url(&format!("/users/{}", handle))
    }

    /// GET with an ActivityStreams Accept header
    pub async fn get_activity_json(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header(header::ACCEPT, ACTIVITY_JSON)
            .send()
            .await
            .unwrap()
    }

    /// Submit an activity to a local outbox
    pub async fn post_outbox(&self, handle: &str, activity: &Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/users/{}/outbox", handle)))
            .header(header::CONTENT_TYPE, ACTIVITY_JSON)
            .body(activity.to_string())
            .send()
            .await
            .unwrap()
    }

    /// POST to a local inbox, signed by a remote actor
    pub async fn post_signed_inbox(
        &self,
        handle: &str,
        remote: &RemoteActorServer,
        body: &[u8],
    ) -> reqwest::Response {
        let url = self.url(&format!("/users/{}/inbox", handle));
        let signed = sign_request(
            "POST",
            &url,
            Some(body),
            &remote.private_key_pem,
            &remote.key_id(),
        )
        .unwrap();

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, ACTIVITY_JSON);
        for (name, value) in signed.into_pairs() {
            request = request.header(name, value);
        }
        request.body(body.to_vec()).send().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// A remote server hosting one actor, `bob`
///
/// Serves the actor document and records every activity POSTed to its inbox.
pub struct RemoteActorServer {
    pub addr: String,
    pub private_key_pem: String,
    received: Arc<Mutex<Vec<Value>>>,
}

#[derive(Clone)]
struct RemoteState {
    actor: Arc<Value>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl RemoteActorServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let (private_key_pem, public_key_pem) = generate_rsa_keypair(1024).unwrap();

        let actor_iri = format!("{}/users/bob", addr);
        let actor = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": actor_iri,
            "type": "Person",
            "preferredUsername": "bob",
            "name": "Bob Candidate",
            "inbox": format!("{}/inbox", actor_iri),
            "outbox": format!("{}/outbox", actor_iri),
            "followers": format!("{}/followers", actor_iri),
            "publicKey": {
                "id": format!("{}#main-key", actor_iri),
                "owner": actor_iri,
                "publicKeyPem": public_key_pem,
            },
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let state = RemoteState {
            actor: Arc::new(actor),
            received: received.clone(),
        };
        let app = Router::new()
            .route("/users/bob", get(remote_actor))
            .route("/users/bob/inbox", post(remote_inbox))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            private_key_pem,
            received,
        }
    }

    pub fn actor_iri(&self) -> String {
        format!("{}/users/bob", self.addr)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_iri())
    }

    pub fn activity_iri(&self, id: &str) -> String {
        format!("{}/activities/{}", self.addr, id)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until an activity of `kind` arrives, or give up after a few seconds
    pub async fn wait_for(&self, kind: &str) -> Option<Value> {
        for _ in 0..50 {
            if let Some(found) = self
                .received()
                .into_iter()
                .find(|activity| activity["type"] == kind)
            {
                return Some(found);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }
}

async fn remote_actor(State(state): State<RemoteState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        Json(state.actor.as_ref().clone()),
    )
}

async fn remote_inbox(State(state): State<RemoteState>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<Value>(&body) {
        Ok(activity) => {
            state.received.lock().unwrap().push(activity);
            StatusCode::ACCEPTED
        }
        Err(_) => StatusCode::BAD_REQUEST,
    }
}
