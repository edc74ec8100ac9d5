//! Actor directory
//!
//! Local actor documents, remote actor discovery and caching, public key
//! resolution for signature verification, WebFinger and NodeInfo.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};

use super::activity::{
    ACTIVITYSTREAMS_CONTEXT, Object, SECURITY_CONTEXT, format_timestamp,
};
use super::key_cache::PublicKeyCache;
use super::signature::{PublicKeyResolver, ResolvedKey, key_owner_iri};
use super::transport::{ACTIVITY_JSON_ACCEPT, Transport};
use super::webfinger::{WebFingerResponse, generate_webfinger_response, parse_acct_resource};
use crate::config::{AppConfig, FollowPolicy, InstanceConfig, LocalActorConfig};
use crate::data::{Database, EntityId, LocalActor, RemoteActor};
use crate::error::{AppError, SignatureError};
use crate::metrics::FEDERATION_FETCHES_TOTAL;

/// Handles are 1..=64 characters of `[a-z0-9_]`
pub fn is_valid_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle.len() <= 64
        && handle
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Generate an RSA keypair as (PKCS#8 private PEM, SPKI public PEM)
pub fn generate_rsa_keypair(bits: usize) -> Result<(String, String), AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("RSA key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("PKCS#8 encoding failed: {}", e)))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("SPKI encoding failed: {}", e)))?;

    Ok((private_pem, public_pem))
}

/// An actor as the processors need it, local or remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub iri: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
    pub is_local: bool,
}

impl From<RemoteActor> for Actor {
    fn from(remote: RemoteActor) -> Self {
        Self {
            iri: remote.iri,
            handle: remote.handle,
            display_name: remote.display_name,
            inbox: remote.inbox,
            shared_inbox: remote.shared_inbox,
            public_key_id: remote.public_key_id,
            public_key_pem: remote.public_key_pem,
            is_local: false,
        }
    }
}

/// Owns actor identity: local documents, remote discovery, key lookup
pub struct ActorDirectory {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    key_cache: Arc<PublicKeyCache>,
    base_url: String,
    domain: String,
    follow_policy: FollowPolicy,
    actor_cache_ttl: Duration,
    instance: InstanceConfig,
}

impl ActorDirectory {
    pub fn new(
        config: &AppConfig,
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        key_cache: Arc<PublicKeyCache>,
    ) -> Self {
        Self {
            db,
            transport,
            key_cache,
            base_url: config.server.base_url(),
            domain: config.server.domain.to_ascii_lowercase(),
            follow_policy: config.federation.follow_policy,
            actor_cache_ttl: config.federation.actor_cache_ttl(),
            instance: config.instance.clone(),
        }
    }

    // =========================================================================
    // Local IRIs
    // =========================================================================

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn actor_iri(&self, handle: &str) -> String {
        format!("{}/users/{}", self.base_url, handle)
    }

    pub fn key_id(&self, handle: &str) -> String {
        format!("{}#main-key", self.actor_iri(handle))
    }

    /// `inbox`, `outbox`, `followers` or `following`
    pub fn collection_iri(&self, handle: &str, collection: &str) -> String {
        format!("{}/{}", self.actor_iri(handle), collection)
    }

    /// Prefix shared by every local actor IRI
    pub fn actor_iri_prefix(&self) -> String {
        format!("{}/users/", self.base_url)
    }

    pub fn new_object_iri(&self) -> String {
        format!("{}/posts/{}", self.base_url, EntityId::new().0)
    }

    pub fn new_activity_iri(&self) -> String {
        format!("{}/activities/{}", self.base_url, EntityId::new().0)
    }

    pub fn object_iri(&self, id: &str) -> String {
        format!("{}/posts/{}", self.base_url, id)
    }

    pub fn activity_iri(&self, id: &str) -> String {
        format!("{}/activities/{}", self.base_url, id)
    }

    /// Handle of a local actor IRI, if it is one
    pub fn local_handle<'a>(&self, iri: &'a str) -> Option<&'a str> {
        let prefix = self.actor_iri_prefix();
        let handle = iri.strip_prefix(prefix.as_str())?;
        is_valid_handle(handle).then_some(handle)
    }

    /// Handle owning a local followers collection IRI
    pub fn followers_collection_owner<'a>(&self, iri: &'a str) -> Option<&'a str> {
        let prefix = self.actor_iri_prefix();
        let handle = iri
            .strip_prefix(prefix.as_str())?
            .strip_suffix("/followers")?;
        is_valid_handle(handle).then_some(handle)
    }

    pub fn is_local_iri(&self, iri: &str) -> bool {
        iri.starts_with(&format!("{}/", self.base_url))
    }

    // =========================================================================
    // Local actors
    // =========================================================================

    /// Create a configured actor if missing, otherwise refresh its profile
    pub async fn provision_local_actor(
        &self,
        actor: &LocalActorConfig,
        key_bits: usize,
    ) -> Result<LocalActor, AppError> {
        if let Some(existing) = self.db.get_local_actor(&actor.handle).await? {
            self.db
                .update_local_actor_profile(
                    &actor.handle,
                    &actor.display_name,
                    actor.bio.as_deref(),
                    actor.avatar_url.as_deref(),
                )
                .await?;
            tracing::debug!(handle = %existing.handle, "Local actor already provisioned");
            return self.get_local_actor(&actor.handle).await;
        }

        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(move || generate_rsa_keypair(key_bits))
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation task failed: {}", e)))??;

        let now = Utc::now();
        let record = LocalActor {
            id: EntityId::new().0,
            handle: actor.handle.clone(),
            display_name: actor.display_name.clone(),
            bio: actor.bio.clone(),
            avatar_url: actor.avatar_url.clone(),
            private_key_pem,
            public_key_pem,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        if self.db.insert_local_actor(&record).await? {
            tracing::info!(handle = %record.handle, actor = %self.actor_iri(&record.handle), "Provisioned local actor");
        }

        self.get_local_actor(&actor.handle).await
    }

    /// Live local actor; `Gone` once tombstoned
    pub async fn get_local_actor(&self, handle: &str) -> Result<LocalActor, AppError> {
        if !is_valid_handle(handle) {
            return Err(AppError::NotFound);
        }

        match self.db.get_local_actor(handle).await? {
            Some(actor) if actor.deleted_at.is_some() => Err(AppError::Gone),
            Some(actor) => Ok(actor),
            None => Err(AppError::NotFound),
        }
    }

    /// Live local actor for processing; tombstoned actors are simply absent
    pub async fn require_local_actor(&self, handle: &str) -> Result<LocalActor, AppError> {
        match self.get_local_actor(handle).await {
            Err(AppError::Gone) => Err(AppError::NotFound),
            other => other,
        }
    }

    /// ActivityPub document for a local actor
    pub fn actor_document(&self, actor: &LocalActor) -> Value {
        let iri = self.actor_iri(&actor.handle);
        let mut document = json!({
            "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
            "id": iri,
            "type": "Person",
            "preferredUsername": actor.handle,
            "name": actor.display_name,
            "summary": actor.bio.clone().unwrap_or_default(),
            "url": iri,
            "inbox": self.collection_iri(&actor.handle, "inbox"),
            "outbox": self.collection_iri(&actor.handle, "outbox"),
            "followers": self.collection_iri(&actor.handle, "followers"),
            "following": self.collection_iri(&actor.handle, "following"),
            "manuallyApprovesFollowers": self.follow_policy == FollowPolicy::Manual,
            "published": format_timestamp(actor.created_at),
            "publicKey": {
                "id": self.key_id(&actor.handle),
                "owner": iri,
                "publicKeyPem": actor.public_key_pem,
            },
        });

        if let (Some(avatar), Value::Object(map)) = (&actor.avatar_url, &mut document) {
            map.insert(
                "icon".to_string(),
                json!({ "type": "Image", "url": avatar }),
            );
        }

        document
    }

    /// Tombstone served in place of a deleted local actor
    pub async fn actor_tombstone(&self, handle: &str) -> Result<Value, AppError> {
        let actor = self.db.get_local_actor(handle).await?.ok_or(AppError::NotFound)?;
        let deleted = actor.deleted_at.ok_or(AppError::NotFound)?;

        Ok(json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "id": self.actor_iri(handle),
            "type": "Tombstone",
            "formerType": "Person",
            "deleted": format_timestamp(deleted),
        }))
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve any actor IRI
    ///
    /// Local IRIs come from the local table. Remote actors are served from
    /// the cache within the TTL; past it they are refetched, falling back to
    /// the stale copy if the refetch fails.
    pub async fn resolve_actor(&self, iri: &str) -> Result<Actor, AppError> {
        if let Some(handle) = self.local_handle(iri) {
            let local = self.require_local_actor(handle).await?;
            return Ok(self.local_as_actor(&local));
        }
        if self.is_local_iri(iri) {
            return Err(AppError::NotFound);
        }

        let cached = self.db.get_remote_actor(iri).await?;
        if let Some(cached) = &cached {
            if cached.deleted_at.is_some() {
                return Err(AppError::NotFound);
            }
            if self.is_fresh(cached) {
                return Ok(cached.clone().into());
            }
        }

        match self.fetch_remote_actor(iri).await {
            Ok(actor) => Ok(actor.into()),
            Err(error) => match cached {
                Some(stale) => {
                    tracing::warn!(actor = %iri, error = %error, "Actor refresh failed, serving stale copy");
                    Ok(stale.into())
                }
                None => Err(error),
            },
        }
    }

    fn local_as_actor(&self, local: &LocalActor) -> Actor {
        Actor {
            iri: self.actor_iri(&local.handle),
            handle: Some(local.handle.clone()),
            display_name: Some(local.display_name.clone()),
            inbox: self.collection_iri(&local.handle, "inbox"),
            shared_inbox: None,
            public_key_id: self.key_id(&local.handle),
            public_key_pem: local.public_key_pem.clone(),
            is_local: true,
        }
    }

    fn is_fresh(&self, actor: &RemoteActor) -> bool {
        let age = Utc::now().signed_duration_since(actor.fetched_at);
        age.to_std().map(|age| age < self.actor_cache_ttl).unwrap_or(true)
    }

    /// Fetch, validate and cache a remote actor document
    pub async fn fetch_remote_actor(&self, iri: &str) -> Result<RemoteActor, AppError> {
        let document = self.fetch_json(iri, "actor").await?;
        let actor = parse_remote_actor(iri, &document)?;

        self.db.upsert_remote_actor(&actor).await?;
        self.key_cache
            .insert(&actor.public_key_id, &actor.iri, &actor.public_key_pem)
            .await;

        tracing::info!(actor = %actor.iri, key_id = %actor.public_key_id, "Fetched remote actor");
        Ok(actor)
    }

    /// GET a remote ActivityPub document and decode it
    async fn fetch_json(&self, iri: &str, kind: &str) -> Result<Value, AppError> {
        let response = match self.transport.get(iri, ACTIVITY_JSON_ACCEPT).await {
            Ok(response) => response,
            Err(error) => {
                FEDERATION_FETCHES_TOTAL.with_label_values(&[kind, "error"]).inc();
                return Err(match error {
                    AppError::Forbidden(_) | AppError::Database(_) => error,
                    other => AppError::Fetch(format!("Failed to fetch {}: {}", iri, other)),
                });
            }
        };

        if response.status == 410 {
            FEDERATION_FETCHES_TOTAL.with_label_values(&[kind, "gone"]).inc();
            return Err(AppError::Gone);
        }
        if !response.is_success() {
            FEDERATION_FETCHES_TOTAL.with_label_values(&[kind, "error"]).inc();
            return Err(AppError::Fetch(format!(
                "Failed to fetch {}: HTTP {}",
                iri, response.status
            )));
        }

        let document = serde_json::from_slice(&response.body).map_err(|e| {
            FEDERATION_FETCHES_TOTAL.with_label_values(&[kind, "invalid"]).inc();
            AppError::Fetch(format!("Invalid JSON from {}: {}", iri, e))
        })?;

        FEDERATION_FETCHES_TOTAL.with_label_values(&[kind, "ok"]).inc();
        Ok(document)
    }

    /// Dereference a content object, local store first
    pub async fn fetch_object(&self, iri: &str) -> Result<Object, AppError> {
        if let Some(stored) = self.db.get_object(iri).await? {
            if stored.is_deleted() {
                return Err(AppError::Gone);
            }
            let document: Value = serde_json::from_str(&stored.document)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Corrupt stored object {}: {}", iri, e)))?;
            return Object::from_value(&document);
        }

        if self.is_local_iri(iri) {
            return Err(AppError::NotFound);
        }

        let document = self.fetch_json(iri, "object").await?;
        let object = Object::from_value(&document)
            .map_err(|e| AppError::Fetch(format!("Unusable object at {}: {}", iri, e)))?;
        if object.id != iri {
            return Err(AppError::Fetch(format!(
                "Object id {} does not match {}",
                object.id, iri
            )));
        }
        Ok(object)
    }

    /// Drop cached keys for an actor (account deletion)
    pub async fn forget_actor_keys(&self, iri: &str) {
        self.key_cache.invalidate_owner(iri).await;
    }

    async fn load_key(&self, key_id: &str, force_fetch: bool) -> Result<ResolvedKey, AppError> {
        let owner = key_owner_iri(key_id);

        if let Some(handle) = self.local_handle(owner) {
            let local = self.require_local_actor(handle).await?;
            if self.key_id(handle) != key_id {
                return Err(SignatureError::UnknownKeyId(key_id.to_string()).into());
            }
            return Ok(ResolvedKey {
                key_id: key_id.to_string(),
                owner: self.actor_iri(handle),
                pem: local.public_key_pem,
                cached: false,
            });
        }

        if !force_fetch {
            if let Some(stored) = self.db.get_remote_actor_by_key_id(key_id).await? {
                if self.is_fresh(&stored) {
                    self.key_cache
                        .insert(key_id, &stored.iri, &stored.public_key_pem)
                        .await;
                    return Ok(ResolvedKey {
                        key_id: key_id.to_string(),
                        owner: stored.iri,
                        pem: stored.public_key_pem,
                        cached: true,
                    });
                }
            }
        }

        // Some servers publish the key as its own document with an owner
        let actor_iri = if key_id.contains('#') {
            owner.to_string()
        } else {
            let document = self.fetch_json(key_id, "key").await?;
            match document.get("owner").and_then(Value::as_str) {
                Some(key_owner) if document.get("publicKeyPem").is_some() => key_owner.to_string(),
                _ => key_id.to_string(),
            }
        };

        let actor = self.fetch_remote_actor(&actor_iri).await?;
        if actor.public_key_id != key_id {
            tracing::warn!(
                key_id = %key_id,
                advertised = %actor.public_key_id,
                "Actor does not advertise the signing key"
            );
            return Err(SignatureError::UnknownKeyId(key_id.to_string()).into());
        }

        Ok(ResolvedKey {
            key_id: key_id.to_string(),
            owner: actor.iri,
            pem: actor.public_key_pem,
            cached: false,
        })
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Answer a WebFinger query for a local account
    pub async fn webfinger(&self, resource: &str) -> Result<WebFingerResponse, AppError> {
        let handle = if resource.starts_with("http://") || resource.starts_with("https://") {
            self.local_handle(resource).ok_or(AppError::NotFound)?.to_string()
        } else {
            let acct = parse_acct_resource(resource)?;
            if acct.domain != self.domain {
                return Err(AppError::NotFound);
            }
            acct.user.to_ascii_lowercase()
        };

        let actor = self.require_local_actor(&handle).await?;
        Ok(generate_webfinger_response(
            &actor.handle,
            &self.domain,
            &self.actor_iri(&actor.handle),
            &self.base_url,
        ))
    }

    /// `/.well-known/nodeinfo` discovery document
    pub fn nodeinfo_links(&self) -> Value {
        json!({
            "links": [{
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", self.base_url),
            }]
        })
    }

    /// NodeInfo 2.0 instance description
    pub async fn node_info(&self) -> Result<Value, AppError> {
        let users = self.db.count_local_actors().await?;
        let posts = self.db.count_local_objects().await?;

        Ok(json!({
            "version": "2.0",
            "software": {
                "name": "openfirm",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "protocols": ["activitypub"],
            "services": { "inbound": [], "outbound": [] },
            "openRegistrations": self.instance.open_registrations,
            "usage": {
                "users": { "total": users },
                "localPosts": posts,
            },
            "metadata": {
                "nodeName": self.instance.title,
                "nodeDescription": self.instance.description,
            },
        }))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

#[async_trait]
impl PublicKeyResolver for ActorDirectory {
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey, AppError> {
        if let Some(cached) = self.key_cache.get(key_id).await {
            return Ok(ResolvedKey {
                key_id: key_id.to_string(),
                owner: cached.owner,
                pem: cached.pem,
                cached: true,
            });
        }
        self.load_key(key_id, false).await
    }

    async fn refresh(&self, key_id: &str) -> Result<ResolvedKey, AppError> {
        self.key_cache.invalidate(key_id).await;
        tracing::info!(key_id = %key_id, "Refreshing remote public key");
        self.load_key(key_id, true).await
    }
}

/// Validate a fetched actor document and map it to a cache row
pub fn parse_remote_actor(iri: &str, document: &Value) -> Result<RemoteActor, AppError> {
    let invalid = |reason: &str| AppError::Fetch(format!("Invalid actor document at {}: {}", iri, reason));

    let id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing id"))?;
    if id != iri {
        return Err(invalid("id does not match the fetched IRI"));
    }

    let inbox = document
        .get("inbox")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing inbox"))?;

    // Usually an object; a few servers send a list
    let public_key = match document.get("publicKey") {
        Some(Value::Array(keys)) => keys.first(),
        other => other,
    }
    .ok_or_else(|| invalid("missing publicKey"))?;

    let key_id = public_key
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing publicKey.id"))?;
    let owner = public_key
        .get("owner")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing publicKey.owner"))?;
    if owner != id {
        return Err(invalid("publicKey.owner does not match id"));
    }
    let pem = public_key
        .get("publicKeyPem")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing publicKeyPem"))?;

    let text = |key: &str| document.get(key).and_then(Value::as_str).map(str::to_string);
    let avatar_url = match document.get("icon") {
        Some(Value::String(url)) => Some(url.clone()),
        Some(icon) => icon.get("url").and_then(Value::as_str).map(str::to_string),
        None => None,
    };
    let shared_inbox = document
        .get("endpoints")
        .and_then(|endpoints| endpoints.get("sharedInbox"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RemoteActor {
        iri: id.to_string(),
        handle: text("preferredUsername"),
        display_name: text("name"),
        bio: text("summary").map(|summary| super::sanitize_remote_html(&summary)),
        avatar_url,
        inbox: inbox.to_string(),
        outbox: text("outbox"),
        followers: text("followers"),
        following: text("following"),
        shared_inbox,
        public_key_id: key_id.to_string(),
        public_key_pem: pem.to_string(),
        fetched_at: Utc::now(),
        deleted_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::tests::generate_test_keypair;
    use crate::federation::transport::{MockTransport, TransportResponse};
    use crate::test_support::{test_config, test_database};

    const BOB: &str = "https://b.example/users/bob";
    const BOB_KEY: &str = "https://b.example/users/bob#main-key";

    fn bob_document(pem: &str) -> Value {
        json!({
            "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
            "id": BOB,
            "type": "Person",
            "preferredUsername": "bob",
            "name": "Bob",
            "summary": "<p>hi<script>alert(1)</script></p>",
            "inbox": "https://b.example/users/bob/inbox",
            "endpoints": { "sharedInbox": "https://b.example/inbox" },
            "icon": { "type": "Image", "url": "https://b.example/bob.png" },
            "publicKey": { "id": BOB_KEY, "owner": BOB, "publicKeyPem": pem },
        })
    }

    fn ok_json(document: &Value) -> TransportResponse {
        TransportResponse {
            status: 200,
            body: document.to_string().into_bytes(),
        }
    }

    async fn directory(transport: MockTransport) -> (tempfile::TempDir, ActorDirectory) {
        let (temp_dir, db) = test_database().await;
        let config = test_config("a.example");
        let directory = ActorDirectory::new(
            &config,
            db,
            Arc::new(transport),
            Arc::new(PublicKeyCache::new(None)),
        );
        (temp_dir, directory)
    }

    #[test]
    fn handle_rules() {
        assert!(is_valid_handle("alice_01"));
        assert!(!is_valid_handle(""));
        assert!(!is_valid_handle("Alice"));
        assert!(!is_valid_handle("alice/outbox"));
        assert!(!is_valid_handle(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn local_actor_document_has_deterministic_iris() {
        let (_temp_dir, directory) = directory(MockTransport::new()).await;
        let alice = directory
            .provision_local_actor(
                &LocalActorConfig {
                    handle: "alice".to_string(),
                    display_name: "Alice".to_string(),
                    bio: None,
                    avatar_url: Some("https://a.example/alice.png".to_string()),
                },
                1024,
            )
            .await
            .unwrap();

        let document = directory.actor_document(&alice);
        assert_eq!(document["id"], "https://a.example/users/alice");
        assert_eq!(document["inbox"], "https://a.example/users/alice/inbox");
        assert_eq!(document["followers"], "https://a.example/users/alice/followers");
        assert_eq!(
            document["publicKey"]["id"],
            "https://a.example/users/alice#main-key"
        );
        assert_eq!(document["publicKey"]["owner"], "https://a.example/users/alice");
        assert_eq!(document["manuallyApprovesFollowers"], true);
        assert_eq!(document["icon"]["url"], "https://a.example/alice.png");

        // Provisioning again keeps the key
        let again = directory
            .provision_local_actor(
                &LocalActorConfig {
                    handle: "alice".to_string(),
                    display_name: "Alice A.".to_string(),
                    bio: None,
                    avatar_url: None,
                },
                1024,
            )
            .await
            .unwrap();
        assert_eq!(again.public_key_pem, alice.public_key_pem);
        assert_eq!(again.display_name, "Alice A.");
    }

    #[tokio::test]
    async fn resolve_actor_fetches_once_within_ttl() {
        let (_, public_pem) = generate_test_keypair();
        let document = bob_document(&public_pem);

        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .withf(|url, _| url == BOB)
            .times(1)
            .returning(move |_, _| Ok(ok_json(&document)));

        let (_temp_dir, directory) = directory(transport).await;

        let first = directory.resolve_actor(BOB).await.unwrap();
        let second = directory.resolve_actor(BOB).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.inbox, "https://b.example/users/bob/inbox");
        assert_eq!(first.shared_inbox.as_deref(), Some("https://b.example/inbox"));

        let stored = directory.db.get_remote_actor(BOB).await.unwrap().unwrap();
        assert_eq!(stored.bio.as_deref(), Some("<p>hi</p>"));
        assert_eq!(stored.avatar_url.as_deref(), Some("https://b.example/bob.png"));
    }

    #[tokio::test]
    async fn resolve_actor_reports_fetch_errors() {
        let mut transport = MockTransport::new();
        transport.expect_get().returning(|_, _| {
            Ok(TransportResponse {
                status: 500,
                body: Vec::new(),
            })
        });

        let (_temp_dir, directory) = directory(transport).await;
        assert!(matches!(
            directory.resolve_actor(BOB).await,
            Err(AppError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn stale_actor_is_served_when_refetch_fails() {
        let (_, public_pem) = generate_test_keypair();
        let mut transport = MockTransport::new();
        transport.expect_get().returning(|_, _| {
            Err(AppError::Fetch("connection refused".to_string()))
        });

        let (_temp_dir, directory) = directory(transport).await;
        let mut stale = parse_remote_actor(BOB, &bob_document(&public_pem)).unwrap();
        stale.fetched_at = Utc::now() - chrono::Duration::days(3);
        directory.db.upsert_remote_actor(&stale).await.unwrap();

        let resolved = directory.resolve_actor(BOB).await.unwrap();
        assert_eq!(resolved.public_key_pem, public_pem);
    }

    #[test]
    fn remote_actor_validation() {
        let (_, public_pem) = generate_test_keypair();

        let mut spoofed = bob_document(&public_pem);
        spoofed["id"] = json!("https://evil.example/users/bob");
        assert!(parse_remote_actor(BOB, &spoofed).is_err());

        let mut foreign_key = bob_document(&public_pem);
        foreign_key["publicKey"]["owner"] = json!("https://evil.example/users/mallory");
        assert!(parse_remote_actor(BOB, &foreign_key).is_err());

        let mut no_inbox = bob_document(&public_pem);
        no_inbox.as_object_mut().unwrap().remove("inbox");
        assert!(parse_remote_actor(BOB, &no_inbox).is_err());
    }

    #[tokio::test]
    async fn resolve_key_rejects_unadvertised_key_id() {
        let (_, public_pem) = generate_test_keypair();
        let document = bob_document(&public_pem);

        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .returning(move |_, _| Ok(ok_json(&document)));

        let (_temp_dir, directory) = directory(transport).await;
        match directory.resolve("https://b.example/users/bob#other-key").await {
            Err(AppError::Signature(SignatureError::UnknownKeyId(_))) => {}
            other => panic!("expected UnknownKeyId, got {other:?}"),
        }

        let key = directory.resolve(BOB_KEY).await.unwrap();
        assert_eq!(key.owner, BOB);
        assert!(!key.cached);

        let again = directory.resolve(BOB_KEY).await.unwrap();
        assert!(again.cached);
    }

    #[tokio::test]
    async fn webfinger_maps_only_local_accounts() {
        let (_temp_dir, directory) = directory(MockTransport::new()).await;
        directory
            .provision_local_actor(
                &LocalActorConfig {
                    handle: "alice".to_string(),
                    display_name: "Alice".to_string(),
                    bio: None,
                    avatar_url: None,
                },
                1024,
            )
            .await
            .unwrap();

        let jrd = directory.webfinger("acct:alice@A.EXAMPLE").await.unwrap();
        assert_eq!(jrd.subject, "acct:alice@a.example");

        assert!(matches!(
            directory.webfinger("acct:alice@b.example").await,
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            directory.webfinger("acct:nobody@a.example").await,
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            directory.webfinger("acct:alice").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn tombstoned_local_actor_is_gone() {
        let (_temp_dir, directory) = directory(MockTransport::new()).await;
        directory
            .provision_local_actor(
                &LocalActorConfig {
                    handle: "carol".to_string(),
                    display_name: "Carol".to_string(),
                    bio: None,
                    avatar_url: None,
                },
                1024,
            )
            .await
            .unwrap();
        directory.db.tombstone_local_actor("carol").await.unwrap();

        assert!(matches!(
            directory.get_local_actor("carol").await,
            Err(AppError::Gone)
        ));
        assert!(matches!(
            directory.resolve_actor("https://a.example/users/carol").await,
            Err(AppError::NotFound)
        ));
        let tombstone = directory.actor_tombstone("carol").await.unwrap();
        assert_eq!(tombstone["type"], "Tombstone");
    }

    #[tokio::test]
    async fn node_info_counts_local_usage() {
        let (_temp_dir, directory) = directory(MockTransport::new()).await;
        let info = directory.node_info().await.unwrap();

        assert_eq!(info["software"]["name"], "openfirm");
        assert_eq!(info["protocols"][0], "activitypub");
        assert_eq!(info["usage"]["users"]["total"], 0);
        assert_eq!(
            directory.nodeinfo_links()["links"][0]["href"],
            "https://a.example/nodeinfo/2.0"
        );
    }
}
