//! Inbox processing
//!
//! Authenticates, validates, deduplicates and applies server-to-server
//! activities addressed to a local actor.
//!
//! Each accepted activity goes through three steps:
//! 1. `prepare`: remote lookups, done before any lock is held
//! 2. `plan`: under the entity locks, turn the activity into [`Mutation`]s
//! 3. commit: the dedupe receipt, every mutation and the inbox entry land in
//!    one transaction

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::HeaderMap;

use super::activity::{Activity, ActivityBody, Object, Tombstone};
use super::actor::{Actor, ActorDirectory};
use super::delivery::{DeliveryEngine, DeliveryRecipient, build_tasks};
use super::locks::{EntityLocks, actor_key, follow_key, object_key};
use super::sanitize_remote_html;
use super::signature::verify_request;
use crate::config::{AppConfig, FollowPolicy};
use crate::data::{
    Database, DeliveryAudience, EntityId, FollowStatus, InboxItem, LocalActor, Mutation,
    OutboxItem, ProcessedActivity, Reaction, ReactionKind, StoredObject,
};
use crate::error::{AppError, SignatureError};
use crate::metrics::ACTIVITIES_RECEIVED;

/// Result of a successful inbox call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Effects applied
    Accepted,
    /// Already processed for this recipient; nothing applied
    Duplicate,
}

impl InboxOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Lookups resolved before taking locks
#[derive(Debug, Default)]
struct Prepared {
    /// (follower, followee) the activity is about
    follow: Option<(String, String)>,
    /// Follower actor, for addressing an Accept
    follower: Option<Actor>,
    /// Reaction an Undo refers to
    reaction: Option<Reaction>,
    /// Resolved Like/Announce target
    target: Option<String>,
}

pub struct InboxProcessor {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    locks: Arc<EntityLocks>,
    delivery: DeliveryEngine,
    follow_policy: FollowPolicy,
    clock_skew: Duration,
}

impl InboxProcessor {
    pub fn new(
        config: &AppConfig,
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        locks: Arc<EntityLocks>,
        delivery: DeliveryEngine,
    ) -> Self {
        Self {
            db,
            directory,
            locks,
            delivery,
            follow_policy: config.federation.follow_policy,
            clock_skew: config.federation.clock_skew(),
        }
    }

    /// Handle a signed POST to `/users/{recipient}/inbox`
    ///
    /// # Arguments
    /// * `recipient` - Local handle from the request path
    /// * `method` - HTTP method as received
    /// * `path` - Request path and query as received
    /// * `headers` - Request headers
    /// * `body` - Raw request body
    ///
    /// # Errors
    /// `Signature` when the request is unsigned or does not verify,
    /// `Validation`/`UnsupportedType` for bad payloads, `ActorMismatch`
    /// when the signer is not the activity's actor, `NotFound` for an
    /// unknown recipient.
    pub async fn handle_inbox(
        &self,
        recipient: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<InboxOutcome, AppError> {
        if !headers.contains_key("signature") {
            ACTIVITIES_RECEIVED
                .with_label_values(&["unknown", "unsigned"])
                .inc();
            return Err(SignatureError::MissingHeader("signature".to_string()).into());
        }

        let activity = match Activity::parse(body) {
            Ok(activity) => activity,
            Err(error) => {
                ACTIVITIES_RECEIVED
                    .with_label_values(&["unknown", error.kind()])
                    .inc();
                tracing::info!(recipient = %recipient, error = %error, "Rejected unparseable activity");
                return Err(error);
            }
        };

        let result = self
            .authenticate_and_apply(recipient, method, path, headers, body, &activity)
            .await;
        record_outcome(&activity, recipient, &result);
        result
    }

    async fn authenticate_and_apply(
        &self,
        recipient: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        let local = self.directory.require_local_actor(recipient).await?;

        let signer = verify_request(
            method,
            path,
            headers,
            body,
            self.directory.as_ref(),
            self.clock_skew,
        )
        .await?;

        if signer != activity.actor {
            return Err(AppError::ActorMismatch(format!(
                "signed by {} but claims {}",
                signer, activity.actor
            )));
        }

        self.apply(&local, activity).await
    }

    /// Apply an activity authored on this server to a local recipient
    ///
    /// No HTTP and no signature: the outbox has already authenticated the
    /// author.
    pub async fn deliver_local(
        &self,
        recipient: &str,
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        let result = match self.directory.require_local_actor(recipient).await {
            Ok(local) => self.apply(&local, activity).await,
            Err(error) => Err(error),
        };
        record_outcome(activity, recipient, &result);
        result
    }

    async fn apply(
        &self,
        recipient: &LocalActor,
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        if self.db.is_processed(&activity.id, &recipient.handle).await? {
            return Ok(InboxOutcome::Duplicate);
        }

        let prepared = self.prepare(activity).await?;
        let _guard = self.locks.lock(lock_keys(activity, &prepared)).await;

        let mut mutations = self.plan(recipient, activity, &prepared).await?;

        let now = Utc::now();
        mutations.push(Mutation::AppendInbox(InboxItem {
            id: EntityId::new().0,
            recipient: recipient.handle.clone(),
            activity_id: activity.id.clone(),
            activity_type: activity.kind().as_str().to_string(),
            actor: activity.actor.clone(),
            document: activity.serialize(),
            published: activity.published.unwrap_or(now),
        }));
        let receipt = ProcessedActivity {
            activity_id: activity.id.clone(),
            recipient: recipient.handle.clone(),
            activity_type: activity.kind().as_str().to_string(),
            actor: activity.actor.clone(),
            processed_at: now,
        };

        let queued = mutations
            .iter()
            .any(|mutation| matches!(mutation, Mutation::EnqueueDelivery(_)));

        if !self.db.commit(Some(&receipt), &mutations).await? {
            return Ok(InboxOutcome::Duplicate);
        }

        if queued {
            self.delivery.wake();
        }
        if let ActivityBody::Delete { object } = &activity.body {
            if object.iri() == activity.actor {
                self.directory.forget_actor_keys(&activity.actor).await;
            }
        }

        Ok(InboxOutcome::Accepted)
    }

    /// Remote and store lookups that must not run under a lock
    async fn prepare(&self, activity: &Activity) -> Result<Prepared, AppError> {
        let mut prepared = Prepared::default();

        match &activity.body {
            ActivityBody::Follow { object } => {
                prepared.follow = Some((activity.actor.clone(), object.clone()));
                if !self.directory.is_local_iri(&activity.actor) {
                    match self.directory.resolve_actor(&activity.actor).await {
                        Ok(actor) => prepared.follower = Some(actor),
                        Err(error) => {
                            tracing::warn!(actor = %activity.actor, error = %error, "Could not resolve follower");
                        }
                    }
                }
            }
            ActivityBody::Undo { object } => match object.embedded() {
                Some(inner) => match &inner.body {
                    ActivityBody::Follow { object: followee } => {
                        prepared.follow = Some((inner.actor.clone(), followee.clone()));
                    }
                    ActivityBody::Like { object: target }
                    | ActivityBody::Announce { object: target } => {
                        prepared.reaction = match self.db.get_reaction(&inner.id).await? {
                            Some(reaction) => Some(reaction),
                            None => {
                                let kind = reaction_kind(inner).unwrap_or(ReactionKind::Like);
                                self.db
                                    .find_reaction(kind, &inner.actor, target.iri())
                                    .await?
                            }
                        };
                    }
                    _ => {}
                },
                None => {
                    if let Some(follow) = self.db.get_follow_by_activity(object.iri()).await? {
                        prepared.follow = Some((follow.follower, follow.followee));
                    } else {
                        prepared.reaction = self.db.get_reaction(object.iri()).await?;
                    }
                }
            },
            ActivityBody::Accept { object } | ActivityBody::Reject { object } => {
                match object.embedded() {
                    Some(inner) => {
                        if let ActivityBody::Follow { object: followee } = &inner.body {
                            prepared.follow = Some((inner.actor.clone(), followee.clone()));
                        }
                    }
                    None => {
                        if let Some(follow) = self.db.get_follow_by_activity(object.iri()).await? {
                            prepared.follow = Some((follow.follower, follow.followee));
                        }
                    }
                }
            }
            ActivityBody::Like { object } | ActivityBody::Announce { object } => {
                match self.directory.fetch_object(object.iri()).await {
                    Ok(target) => prepared.target = Some(target.id),
                    Err(error) => {
                        tracing::warn!(
                            activity_id = %activity.id,
                            object = %object.iri(),
                            error = %error,
                            "Reaction target unresolvable, recording activity only"
                        );
                    }
                }
            }
            ActivityBody::Create { .. }
            | ActivityBody::Update { .. }
            | ActivityBody::Delete { .. } => {}
        }

        Ok(prepared)
    }

    /// Turn an activity into store mutations; runs under the entity locks
    async fn plan(
        &self,
        recipient: &LocalActor,
        activity: &Activity,
        prepared: &Prepared,
    ) -> Result<Vec<Mutation>, AppError> {
        let mut mutations = Vec::new();
        let now = Utc::now();

        match &activity.body {
            ActivityBody::Follow { object } => {
                let followee_handle = self.directory.local_handle(object).ok_or_else(|| {
                    AppError::Validation(format!("Follow target {} is not a local actor", object))
                })?;
                if *object == activity.actor {
                    return Err(AppError::Validation("An actor cannot follow itself".to_string()));
                }
                self.directory.require_local_actor(followee_handle).await?;

                let already_accepted = self
                    .db
                    .get_follow(&activity.actor, object)
                    .await?
                    .is_some_and(|follow| follow.status == FollowStatus::Accepted);

                let status = if already_accepted || self.follow_policy == FollowPolicy::AutoAccept {
                    FollowStatus::Accepted
                } else {
                    FollowStatus::Pending
                };

                if !already_accepted {
                    mutations.push(Mutation::RequestFollow {
                        follower: activity.actor.clone(),
                        followee: object.clone(),
                        follow_activity_id: activity.id.clone(),
                        status,
                    });
                }

                if status == FollowStatus::Accepted && followee_handle == recipient.handle {
                    self.plan_accept(recipient, activity, prepared, &mut mutations);
                }
            }

            ActivityBody::Undo { object } => {
                if let Some(inner) = object.embedded() {
                    if inner.actor != activity.actor {
                        return Err(AppError::ActorMismatch(format!(
                            "{} cannot undo an activity by {}",
                            activity.actor, inner.actor
                        )));
                    }
                }

                if let Some((follower, followee)) = &prepared.follow {
                    if *follower != activity.actor {
                        return Err(AppError::ActorMismatch(format!(
                            "{} cannot undo a follow by {}",
                            activity.actor, follower
                        )));
                    }
                    mutations.push(Mutation::RemoveFollow {
                        follower: follower.clone(),
                        followee: followee.clone(),
                    });
                } else if let Some(reaction) = &prepared.reaction {
                    if reaction.actor != activity.actor {
                        return Err(AppError::ActorMismatch(format!(
                            "{} cannot undo a reaction by {}",
                            activity.actor, reaction.actor
                        )));
                    }
                    mutations.push(Mutation::RemoveReaction {
                        activity_id: reaction.activity_id.clone(),
                        actor: reaction.actor.clone(),
                    });
                } else {
                    tracing::debug!(activity_id = %activity.id, object = %object.iri(), "Undo target not found");
                }
            }

            ActivityBody::Accept { .. } | ActivityBody::Reject { .. } => {
                match &prepared.follow {
                    Some((follower, followee)) => {
                        if *followee != activity.actor || self.directory.local_handle(follower).is_none() {
                            return Err(AppError::ActorMismatch(format!(
                                "{} cannot answer a follow of {} by {}",
                                activity.actor, followee, follower
                            )));
                        }
                        let to = match activity.body {
                            ActivityBody::Accept { .. } => FollowStatus::Accepted,
                            _ => FollowStatus::Rejected,
                        };
                        mutations.push(Mutation::TransitionFollow {
                            follower: follower.clone(),
                            followee: followee.clone(),
                            from: FollowStatus::Pending,
                            to,
                        });
                    }
                    None => {
                        tracing::debug!(activity_id = %activity.id, "No follow request to answer, ignoring");
                    }
                }
            }

            ActivityBody::Create { object } => {
                if object.attributed_to != activity.actor {
                    return Err(AppError::ActorMismatch(format!(
                        "{} cannot create an object attributed to {}",
                        activity.actor, object.attributed_to
                    )));
                }
                if !same_origin(&object.id, &activity.actor) {
                    return Err(AppError::ActorMismatch(format!(
                        "{} cannot create {} on another origin",
                        activity.actor, object.id
                    )));
                }

                let object = sanitized(object);
                let is_local = self.directory.is_local_iri(&object.id);
                mutations.push(Mutation::InsertObject(stored_object(&object, is_local)));
            }

            ActivityBody::Update { object } => {
                let stored = self
                    .db
                    .get_object(&object.id)
                    .await?
                    .filter(|stored| !stored.is_deleted())
                    .ok_or(AppError::NotFound)?;
                if stored.attributed_to != activity.actor || object.attributed_to != activity.actor {
                    return Err(AppError::ActorMismatch(format!(
                        "{} does not own {}",
                        activity.actor, object.id
                    )));
                }

                let mut object = sanitized(object);
                let updated_at = object.updated.unwrap_or(now);
                object.updated = Some(updated_at);
                mutations.push(Mutation::ReplaceObject {
                    iri: object.id.clone(),
                    attributed_to: activity.actor.clone(),
                    document: object.to_value().to_string(),
                    updated_at,
                });
            }

            ActivityBody::Delete { object } => {
                let iri = object.iri();
                if iri == activity.actor {
                    if self.directory.is_local_iri(iri) {
                        return Err(AppError::ActorMismatch(format!(
                            "local actor {} cannot be deleted over federation",
                            iri
                        )));
                    }
                    mutations.push(Mutation::TombstoneRemoteActor {
                        iri: iri.to_string(),
                    });
                    mutations.push(Mutation::RemoveFollowsOf {
                        actor: iri.to_string(),
                    });
                } else {
                    match self.db.get_object(iri).await? {
                        Some(stored) if !stored.is_deleted() => {
                            if stored.attributed_to != activity.actor {
                                return Err(AppError::ActorMismatch(format!(
                                    "{} does not own {}",
                                    activity.actor, iri
                                )));
                            }
                            let tombstone = Tombstone {
                                id: iri.to_string(),
                                former_type: Some(stored.object_type.clone()),
                                deleted: Some(now),
                            };
                            mutations.push(Mutation::TombstoneObject {
                                iri: iri.to_string(),
                                attributed_to: activity.actor.clone(),
                                tombstone: tombstone.to_value().to_string(),
                                deleted_at: now,
                            });
                        }
                        _ => {
                            tracing::debug!(object = %iri, "Delete of unknown or deleted object");
                        }
                    }
                }
            }

            ActivityBody::Like { .. } | ActivityBody::Announce { .. } => {
                if let (Some(target), Some(kind)) = (&prepared.target, reaction_kind(activity)) {
                    mutations.push(Mutation::InsertReaction(Reaction {
                        activity_id: activity.id.clone(),
                        kind,
                        actor: activity.actor.clone(),
                        object_iri: target.clone(),
                        created_at: now,
                    }));
                }
            }
        }

        Ok(mutations)
    }

    /// Accept a follow on behalf of `recipient`, queueing delivery to a remote follower
    fn plan_accept(
        &self,
        recipient: &LocalActor,
        follow: &Activity,
        prepared: &Prepared,
        mutations: &mut Vec<Mutation>,
    ) {
        let now = Utc::now();
        let accept = Activity {
            id: self.directory.new_activity_iri(),
            actor: self.directory.actor_iri(&recipient.handle),
            published: Some(now),
            to: vec![follow.actor.clone()],
            cc: Vec::new(),
            body: ActivityBody::Accept {
                object: super::activity::Reference::Embedded(Box::new(follow.clone())),
            },
        };

        mutations.push(Mutation::AppendOutbox(OutboxItem {
            activity_id: accept.id.clone(),
            actor_handle: recipient.handle.clone(),
            activity_type: accept.kind().as_str().to_string(),
            object_iri: Some(follow.id.clone()),
            document: accept.serialize(),
            published: now,
        }));

        // A local follower shares the relationship row; nothing to send
        if let Some(follower) = &prepared.follower {
            let recipients = vec![DeliveryRecipient {
                actor: Some(follower.iri.clone()),
                inbox: follower.inbox.clone(),
                audience: DeliveryAudience::Direct,
            }];
            for task in build_tasks(&accept, &recipient.handle, recipients) {
                mutations.push(Mutation::EnqueueDelivery(task));
            }
        }

        tracing::info!(
            follower = %follow.actor,
            followee = %accept.actor,
            accept_id = %accept.id,
            "Accepting follow"
        );
    }
}

/// Every entity an activity may touch
fn lock_keys(activity: &Activity, prepared: &Prepared) -> Vec<String> {
    let mut keys = Vec::new();

    if let Some((follower, followee)) = &prepared.follow {
        keys.push(follow_key(follower, followee));
    }
    if let Some(reaction) = &prepared.reaction {
        keys.push(object_key(&reaction.object_iri));
    }
    if let Some(target) = &prepared.target {
        keys.push(object_key(target));
    }

    match &activity.body {
        ActivityBody::Create { object } | ActivityBody::Update { object } => {
            keys.push(object_key(&object.id));
        }
        ActivityBody::Delete { object } => {
            if object.iri() == activity.actor {
                keys.push(actor_key(&activity.actor));
            } else {
                keys.push(object_key(object.iri()));
            }
        }
        _ => {}
    }

    keys
}

fn reaction_kind(activity: &Activity) -> Option<ReactionKind> {
    match activity.body {
        ActivityBody::Like { .. } => Some(ReactionKind::Like),
        ActivityBody::Announce { .. } => Some(ReactionKind::Announce),
        _ => None,
    }
}

/// Copy of an object with its HTML cleaned
fn sanitized(object: &Object) -> Object {
    let mut object = object.clone();
    object.content = sanitize_remote_html(&object.content);
    object.summary = object.summary.as_deref().map(sanitize_remote_html);
    object
}

/// Row for a content object
pub(crate) fn stored_object(object: &Object, is_local: bool) -> StoredObject {
    StoredObject {
        iri: object.id.clone(),
        object_type: object.kind.as_str().to_string(),
        attributed_to: object.attributed_to.clone(),
        in_reply_to: object.in_reply_to.clone(),
        document: object.to_value().to_string(),
        is_local,
        published: object.published,
        updated_at: object.updated,
        deleted_at: None,
    }
}

/// Same scheme, host and port
fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str().is_some()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

fn record_outcome(activity: &Activity, recipient: &str, result: &Result<InboxOutcome, AppError>) {
    let kind = activity.kind().as_str();
    match result {
        Ok(outcome) => {
            ACTIVITIES_RECEIVED
                .with_label_values(&[kind, outcome.as_str()])
                .inc();
            tracing::info!(
                activity_id = %activity.id,
                activity_type = kind,
                actor = %activity.actor,
                recipient = %recipient,
                outcome = outcome.as_str(),
                "Processed inbox activity"
            );
        }
        Err(error) => {
            ACTIVITIES_RECEIVED
                .with_label_values(&[kind, error.kind()])
                .inc();
            tracing::info!(
                activity_id = %activity.id,
                activity_type = kind,
                actor = %activity.actor,
                recipient = %recipient,
                error = %error,
                "Rejected inbox activity"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalActorConfig;
    use crate::federation::activity::{
        ACTIVITYSTREAMS_CONTEXT, ObjectType, PUBLIC_COLLECTION, Reference, SECURITY_CONTEXT,
    };
    use crate::federation::key_cache::PublicKeyCache;
    use crate::federation::signature::tests::{build_signed_header_map, generate_test_keypair};
    use crate::federation::transport::{MockTransport, Transport, TransportResponse};
    use crate::test_support::{test_config, test_database};
    use serde_json::{Value, json};

    const ALICE: &str = "https://a.example/users/alice";
    const ALICE_INBOX: &str = "https://a.example/users/alice/inbox";
    const BOB: &str = "https://b.example/users/bob";
    const BOB_KEY: &str = "https://b.example/users/bob#main-key";
    const BOB_NOTE: &str = "https://b.example/notes/1";

    struct Harness {
        _temp_dir: tempfile::TempDir,
        db: Arc<Database>,
        inbox: InboxProcessor,
        bob_private_pem: String,
    }

    fn bob_document(pem: &str) -> Value {
        json!({
            "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
            "id": BOB,
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": "https://b.example/users/bob/inbox",
            "publicKey": { "id": BOB_KEY, "owner": BOB, "publicKeyPem": pem },
        })
    }

    async fn harness(policy: FollowPolicy) -> Harness {
        let (bob_private_pem, bob_public_pem) = generate_test_keypair();
        let bob = bob_document(&bob_public_pem);
        let note = json!({
            "id": BOB_NOTE,
            "type": "Note",
            "attributedTo": BOB,
            "content": "remote note",
            "published": "2025-01-01T00:00:00Z",
        });

        let mut transport = MockTransport::new();
        transport.expect_get().returning(move |url, _| {
            let document = match url {
                BOB => &bob,
                BOB_NOTE => &note,
                _ => {
                    return Ok(TransportResponse {
                        status: 404,
                        body: Vec::new(),
                    });
                }
            };
            Ok(TransportResponse {
                status: 200,
                body: document.to_string().into_bytes(),
            })
        });

        let (temp_dir, db) = test_database().await;
        let mut config = test_config("a.example");
        config.federation.follow_policy = policy;

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let directory = Arc::new(ActorDirectory::new(
            &config,
            db.clone(),
            transport.clone(),
            Arc::new(PublicKeyCache::new(None)),
        ));
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

        let delivery = DeliveryEngine::new(
            db.clone(),
            directory.clone(),
            transport,
            config.delivery.clone(),
        );
        let inbox = InboxProcessor::new(
            &config,
            db.clone(),
            directory,
            Arc::new(EntityLocks::new()),
            delivery,
        );

        Harness {
            _temp_dir: temp_dir,
            db,
            inbox,
            bob_private_pem,
        }
    }

    fn activity(id: &str, actor: &str, body: ActivityBody) -> Activity {
        Activity {
            id: id.to_string(),
            actor: actor.to_string(),
            published: Some(Utc::now()),
            to: vec![PUBLIC_COLLECTION.to_string()],
            cc: Vec::new(),
            body,
        }
    }

    fn bob_follow(id: &str) -> Activity {
        activity(
            id,
            BOB,
            ActivityBody::Follow {
                object: ALICE.to_string(),
            },
        )
    }

    fn note(id: &str, attributed_to: &str, content: &str) -> Object {
        Object {
            id: id.to_string(),
            kind: ObjectType::Note,
            attributed_to: attributed_to.to_string(),
            content: content.to_string(),
            published: Utc::now(),
            name: None,
            summary: None,
            in_reply_to: None,
            updated: None,
            url: None,
            to: vec![PUBLIC_COLLECTION.to_string()],
            cc: Vec::new(),
            location: None,
            employment_type: None,
            salary_range: None,
            expires: None,
        }
    }

    impl Harness {
        async fn post_signed(&self, body: &[u8]) -> Result<InboxOutcome, AppError> {
            let (headers, path) =
                build_signed_header_map("POST", ALICE_INBOX, Some(body), &self.bob_private_pem, BOB_KEY);
            self.inbox
                .handle_inbox("alice", "POST", &path, &headers, body)
                .await
        }
    }

    #[tokio::test]
    async fn signed_follow_is_pending_and_deduplicated() {
        let harness = harness(FollowPolicy::Manual).await;
        let body = bob_follow("https://b.example/activities/follow-1").serialize();

        let first = harness.post_signed(body.as_bytes()).await.unwrap();
        assert_eq!(first, InboxOutcome::Accepted);

        let second = harness.post_signed(body.as_bytes()).await.unwrap();
        assert_eq!(second, InboxOutcome::Duplicate);

        let follow = harness.db.get_follow(BOB, ALICE).await.unwrap().unwrap();
        assert_eq!(follow.status, FollowStatus::Pending);
        assert_eq!(harness.db.count_followers(ALICE).await.unwrap(), 0);
        assert_eq!(harness.db.count_inbox("alice").await.unwrap(), 1);
        assert_eq!(harness.db.count_processed().await.unwrap(), 1);
        assert_eq!(harness.db.delivery_stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn auto_accept_queues_an_accept() {
        let harness = harness(FollowPolicy::AutoAccept).await;
        let body = bob_follow("https://b.example/activities/follow-2").serialize();

        harness.post_signed(body.as_bytes()).await.unwrap();

        let follow = harness.db.get_follow(BOB, ALICE).await.unwrap().unwrap();
        assert_eq!(follow.status, FollowStatus::Accepted);
        assert_eq!(harness.db.count_followers(ALICE).await.unwrap(), 1);
        assert_eq!(harness.db.delivery_stats().await.unwrap().pending, 1);

        let outbox = harness.db.list_outbox("alice", 20, 0).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].activity_type, "Accept");

        let tasks = harness
            .db
            .delivery_tasks_for_activity(&outbox[0].activity_id)
            .await
            .unwrap();
        assert_eq!(tasks[0].recipient_inbox, "https://b.example/users/bob/inbox");
    }

    #[tokio::test]
    async fn repeated_follow_of_accepted_pair_reissues_accept() {
        let harness = harness(FollowPolicy::AutoAccept).await;
        harness
            .inbox
            .deliver_local("alice", &bob_follow("https://b.example/activities/f1"))
            .await
            .unwrap();
        harness
            .inbox
            .deliver_local("alice", &bob_follow("https://b.example/activities/f2"))
            .await
            .unwrap();

        assert_eq!(harness.db.count_outbox("alice").await.unwrap(), 2);
        assert_eq!(harness.db.count_followers(ALICE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_without_effects() {
        let harness = harness(FollowPolicy::AutoAccept).await;
        let body = bob_follow("https://b.example/activities/follow-3").serialize();
        let (headers, path) = build_signed_header_map(
            "POST",
            ALICE_INBOX,
            Some(body.as_bytes()),
            &harness.bob_private_pem,
            BOB_KEY,
        );
        let tampered = body.replace("follow-3", "follow-4");

        let result = harness
            .inbox
            .handle_inbox("alice", "POST", &path, &headers, tampered.as_bytes())
            .await;

        assert!(matches!(
            result,
            Err(AppError::Signature(SignatureError::DigestMismatch))
        ));
        assert!(harness.db.get_follow(BOB, ALICE).await.unwrap().is_none());
        assert_eq!(harness.db.count_processed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsigned_post_is_rejected() {
        let harness = harness(FollowPolicy::Manual).await;
        let body = bob_follow("https://b.example/activities/follow-5").serialize();

        let result = harness
            .inbox
            .handle_inbox("alice", "POST", "/users/alice/inbox", &HeaderMap::new(), body.as_bytes())
            .await;
        assert!(matches!(
            result,
            Err(AppError::Signature(SignatureError::MissingHeader(_)))
        ));
    }

    #[tokio::test]
    async fn signer_must_be_the_actor() {
        let harness = harness(FollowPolicy::Manual).await;
        let body = activity(
            "https://c.example/activities/1",
            "https://c.example/users/carol",
            ActivityBody::Follow {
                object: ALICE.to_string(),
            },
        )
        .serialize();

        let result = harness.post_signed(body.as_bytes()).await;
        assert!(matches!(result, Err(AppError::ActorMismatch(_))));
        assert_eq!(harness.db.count_processed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected_before_the_store() {
        let harness = harness(FollowPolicy::Manual).await;
        let body = json!({
            "id": "https://b.example/activities/x",
            "type": "FooBar",
            "actor": BOB,
            "object": ALICE,
        })
        .to_string();

        let result = harness.post_signed(body.as_bytes()).await;
        assert!(matches!(result, Err(AppError::UnsupportedType(_))));
        assert_eq!(harness.db.count_processed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn follow_of_remote_actor_is_invalid() {
        let harness = harness(FollowPolicy::Manual).await;
        let follow = activity(
            "https://b.example/activities/f9",
            BOB,
            ActivityBody::Follow {
                object: "https://c.example/users/carol".to_string(),
            },
        );

        let result = harness.inbox.deliver_local("alice", &follow).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn undo_follow_removes_and_checks_actor() {
        let harness = harness(FollowPolicy::AutoAccept).await;
        let follow = bob_follow("https://b.example/activities/f3");
        harness.inbox.deliver_local("alice", &follow).await.unwrap();

        let forged = activity(
            "https://c.example/activities/undo",
            "https://c.example/users/carol",
            ActivityBody::Undo {
                object: Reference::Embedded(Box::new(follow.clone())),
            },
        );
        assert!(matches!(
            harness.inbox.deliver_local("alice", &forged).await,
            Err(AppError::ActorMismatch(_))
        ));

        let undo = activity(
            "https://b.example/activities/undo-f3",
            BOB,
            ActivityBody::Undo {
                object: Reference::Iri(follow.id.clone()),
            },
        );
        harness.inbox.deliver_local("alice", &undo).await.unwrap();
        assert!(harness.db.get_follow(BOB, ALICE).await.unwrap().is_none());

        // Undoing again is a no-op
        let again = activity(
            "https://b.example/activities/undo-f3-again",
            BOB,
            ActivityBody::Undo {
                object: Reference::Embedded(Box::new(follow)),
            },
        );
        assert_eq!(
            harness.inbox.deliver_local("alice", &again).await.unwrap(),
            InboxOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn accept_resolves_outbound_follow() {
        let harness = harness(FollowPolicy::Manual).await;
        let follow_id = "https://a.example/activities/follow-bob";
        harness
            .db
            .commit(
                None,
                &[Mutation::RequestFollow {
                    follower: ALICE.to_string(),
                    followee: BOB.to_string(),
                    follow_activity_id: follow_id.to_string(),
                    status: FollowStatus::Pending,
                }],
            )
            .await
            .unwrap();

        let accept = activity(
            "https://b.example/activities/accept-1",
            BOB,
            ActivityBody::Accept {
                object: Reference::Iri(follow_id.to_string()),
            },
        );
        harness.inbox.deliver_local("alice", &accept).await.unwrap();

        let follow = harness.db.get_follow(ALICE, BOB).await.unwrap().unwrap();
        assert_eq!(follow.status, FollowStatus::Accepted);
        assert_eq!(harness.db.count_following(ALICE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reject_closes_outbound_follow() {
        let harness = harness(FollowPolicy::Manual).await;
        let follow_id = "https://a.example/activities/follow-bob-2";
        harness
            .db
            .commit(
                None,
                &[Mutation::RequestFollow {
                    follower: ALICE.to_string(),
                    followee: BOB.to_string(),
                    follow_activity_id: follow_id.to_string(),
                    status: FollowStatus::Pending,
                }],
            )
            .await
            .unwrap();

        let reject = activity(
            "https://b.example/activities/reject-1",
            BOB,
            ActivityBody::Reject {
                object: Reference::Iri(follow_id.to_string()),
            },
        );
        let outcome = harness.inbox.deliver_local("alice", &reject).await.unwrap();
        assert_eq!(outcome, InboxOutcome::Accepted);

        let follow = harness.db.get_follow(ALICE, BOB).await.unwrap().unwrap();
        assert_eq!(follow.status, FollowStatus::Rejected);
        assert_eq!(harness.db.count_following(ALICE).await.unwrap(), 0);
        assert!(harness.db.list_following(ALICE, 20, 0).await.unwrap().is_empty());

        // A late Accept cannot revive a rejected request
        let accept = activity(
            "https://b.example/activities/accept-late",
            BOB,
            ActivityBody::Accept {
                object: Reference::Iri(follow_id.to_string()),
            },
        );
        harness.inbox.deliver_local("alice", &accept).await.unwrap();
        let follow = harness.db.get_follow(ALICE, BOB).await.unwrap().unwrap();
        assert_eq!(follow.status, FollowStatus::Rejected);
    }

    #[tokio::test]
    async fn create_requires_matching_attribution_and_sanitizes() {
        let harness = harness(FollowPolicy::Manual).await;

        let forged = activity(
            "https://b.example/activities/c0",
            BOB,
            ActivityBody::Create {
                object: note("https://b.example/notes/9", "https://c.example/users/carol", "x"),
            },
        );
        assert!(matches!(
            harness.inbox.deliver_local("alice", &forged).await,
            Err(AppError::ActorMismatch(_))
        ));

        let create = activity(
            "https://b.example/activities/c1",
            BOB,
            ActivityBody::Create {
                object: note(
                    "https://b.example/notes/2",
                    BOB,
                    "<p>hello</p><script>alert(1)</script>",
                ),
            },
        );
        harness.inbox.deliver_local("alice", &create).await.unwrap();

        let stored = harness
            .db
            .get_object("https://b.example/notes/2")
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_local);
        assert!(stored.document.contains("<p>hello</p>"));
        assert!(!stored.document.contains("script"));
        assert_eq!(harness.db.count_inbox("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_respect_ownership() {
        let harness = harness(FollowPolicy::Manual).await;
        let iri = "https://b.example/notes/3";

        let missing = activity(
            "https://b.example/activities/u0",
            BOB,
            ActivityBody::Update {
                object: note(iri, BOB, "edited"),
            },
        );
        assert!(matches!(
            harness.inbox.deliver_local("alice", &missing).await,
            Err(AppError::NotFound)
        ));

        let create = activity(
            "https://b.example/activities/c3",
            BOB,
            ActivityBody::Create {
                object: note(iri, BOB, "original"),
            },
        );
        harness.inbox.deliver_local("alice", &create).await.unwrap();

        let update = activity(
            "https://b.example/activities/u1",
            BOB,
            ActivityBody::Update {
                object: note(iri, BOB, "edited"),
            },
        );
        harness.inbox.deliver_local("alice", &update).await.unwrap();
        let stored = harness.db.get_object(iri).await.unwrap().unwrap();
        assert!(stored.document.contains("edited"));

        let delete = activity(
            "https://b.example/activities/d1",
            BOB,
            ActivityBody::Delete {
                object: Reference::Iri(iri.to_string()),
            },
        );
        harness.inbox.deliver_local("alice", &delete).await.unwrap();
        let stored = harness.db.get_object(iri).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert!(stored.document.contains("Tombstone"));

        // Deleting an absent object is a no-op
        let absent = activity(
            "https://b.example/activities/d2",
            BOB,
            ActivityBody::Delete {
                object: Reference::Iri("https://b.example/notes/404".to_string()),
            },
        );
        assert_eq!(
            harness.inbox.deliver_local("alice", &absent).await.unwrap(),
            InboxOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn like_records_reaction_and_undo_removes_it() {
        let harness = harness(FollowPolicy::Manual).await;

        let like = activity(
            "https://b.example/activities/like-1",
            BOB,
            ActivityBody::Like {
                object: Reference::Iri(BOB_NOTE.to_string()),
            },
        );
        harness.inbox.deliver_local("alice", &like).await.unwrap();
        assert_eq!(
            harness
                .db
                .count_reactions(BOB_NOTE, ReactionKind::Like)
                .await
                .unwrap(),
            1
        );

        let undo = activity(
            "https://b.example/activities/unlike-1",
            BOB,
            ActivityBody::Undo {
                object: Reference::Embedded(Box::new(like)),
            },
        );
        harness.inbox.deliver_local("alice", &undo).await.unwrap();
        assert_eq!(
            harness
                .db
                .count_reactions(BOB_NOTE, ReactionKind::Like)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn announce_records_reaction_once() {
        let harness = harness(FollowPolicy::Manual).await;

        let announce = activity(
            "https://b.example/activities/boost-1",
            BOB,
            ActivityBody::Announce {
                object: Reference::Iri(BOB_NOTE.to_string()),
            },
        );
        harness.inbox.deliver_local("alice", &announce).await.unwrap();
        assert_eq!(
            harness.inbox.deliver_local("alice", &announce).await.unwrap(),
            InboxOutcome::Duplicate
        );

        let reaction = harness.db.get_reaction(&announce.id).await.unwrap().unwrap();
        assert!(matches!(reaction.kind, ReactionKind::Announce));
        assert_eq!(reaction.actor, BOB);
        assert_eq!(reaction.object_iri, BOB_NOTE);
        assert_eq!(
            harness
                .db
                .count_reactions(BOB_NOTE, ReactionKind::Announce)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            harness
                .db
                .count_reactions(BOB_NOTE, ReactionKind::Like)
                .await
                .unwrap(),
            0
        );
        assert_eq!(harness.db.count_inbox("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unresolvable_like_is_still_accepted() {
        let harness = harness(FollowPolicy::Manual).await;
        let like = activity(
            "https://b.example/activities/like-2",
            BOB,
            ActivityBody::Like {
                object: Reference::Iri("https://b.example/notes/missing".to_string()),
            },
        );

        let outcome = harness.inbox.deliver_local("alice", &like).await.unwrap();
        assert_eq!(outcome, InboxOutcome::Accepted);
        assert_eq!(harness.db.count_inbox("alice").await.unwrap(), 1);
        assert!(harness.db.get_reaction(&like.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn actor_delete_tombstones_and_drops_follows() {
        let harness = harness(FollowPolicy::AutoAccept).await;
        harness
            .inbox
            .deliver_local("alice", &bob_follow("https://b.example/activities/f7"))
            .await
            .unwrap();
        assert!(harness.db.get_remote_actor(BOB).await.unwrap().is_some());

        let delete = activity(
            "https://b.example/activities/delete-bob",
            BOB,
            ActivityBody::Delete {
                object: Reference::Iri(BOB.to_string()),
            },
        );
        harness.inbox.deliver_local("alice", &delete).await.unwrap();

        let bob = harness.db.get_remote_actor(BOB).await.unwrap().unwrap();
        assert!(bob.deleted_at.is_some());
        assert!(harness.db.get_follow(BOB, ALICE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_duplicates_apply_once() {
        let harness = Arc::new(harness(FollowPolicy::Manual).await);
        let follow = bob_follow("https://b.example/activities/race");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let harness = harness.clone();
            let follow = follow.clone();
            handles.push(tokio::spawn(async move {
                harness.inbox.deliver_local("alice", &follow).await.unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() == InboxOutcome::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(harness.db.count_inbox("alice").await.unwrap(), 1);
    }

    #[test]
    fn origin_comparison() {
        assert!(same_origin("https://b.example/notes/1", BOB));
        assert!(!same_origin("https://c.example/notes/1", BOB));
        assert!(!same_origin("https://b.example:8443/notes/1", BOB));
        assert!(!same_origin("urn:uuid:1", BOB));
    }
}
