//! Outbox processing
//!
//! Accepts activities authored by a local actor, persists their local side
//! effect, appends them to the outbox and queues delivery. Recipients on
//! this server are handed straight to the inbox processor.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};

use super::activity::{
    Activity, ActivityBody, ActivityType, ObjectType, PUBLIC_COLLECTION, Tombstone,
    format_timestamp,
};
use super::actor::ActorDirectory;
use super::delivery::{DeliveryEngine, DeliveryRecipient, build_tasks};
use super::inbox::{InboxProcessor, stored_object};
use super::locks::{EntityLocks, follow_key, object_key};
use crate::data::{
    Database, DeliveryAudience, FollowRelationship, FollowStatus, Mutation, OutboxItem, Reaction,
    ReactionKind,
};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_SENT;

/// Lookups resolved before taking locks
#[derive(Debug, Default)]
struct Prepared {
    /// (follower, followee) the activity is about
    follow: Option<(String, String)>,
    /// Reaction an Undo removes
    reaction: Option<Reaction>,
    /// Actors that must receive the activity whatever the addressing
    direct: Vec<String>,
}

/// Who an activity goes to
#[derive(Debug, Default)]
struct Fanout {
    remote: Vec<DeliveryRecipient>,
    local: Vec<String>,
}

pub struct OutboxProcessor {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    locks: Arc<EntityLocks>,
    delivery: DeliveryEngine,
    inbox: Arc<InboxProcessor>,
}

impl OutboxProcessor {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        locks: Arc<EntityLocks>,
        delivery: DeliveryEngine,
        inbox: Arc<InboxProcessor>,
    ) -> Self {
        Self {
            db,
            directory,
            locks,
            delivery,
            inbox,
        }
    }

    /// Handle a POST to `/users/{handle}/outbox`
    ///
    /// Returns the canonical activity with server-assigned identifiers.
    /// Delivery happens later; its failures never surface here.
    pub async fn handle_outbox(&self, handle: &str, body: &[u8]) -> Result<Activity, AppError> {
        let sender = self.directory.require_local_actor(handle).await?;
        let actor_iri = self.directory.actor_iri(&sender.handle);

        let submitted: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
        let normalized = self.normalize(&actor_iri, submitted).await?;
        let activity = Activity::from_value(&normalized)?;

        let prepared = self.prepare(&actor_iri, &activity).await?;
        let fanout = self
            .fanout(&sender.handle, &actor_iri, &activity, &prepared)
            .await?;

        {
            let _guard = self.locks.lock(lock_keys(&activity, &prepared)).await;

            let mut mutations = self.plan(&actor_iri, &activity, &prepared).await?;
            mutations.push(Mutation::AppendOutbox(OutboxItem {
                activity_id: activity.id.clone(),
                actor_handle: sender.handle.clone(),
                activity_type: activity.kind().as_str().to_string(),
                object_iri: Some(activity.object_iri().to_string()),
                document: activity.serialize(),
                published: activity.published.unwrap_or_else(Utc::now),
            }));
            for task in build_tasks(&activity, &sender.handle, fanout.remote.clone()) {
                mutations.push(Mutation::EnqueueDelivery(task));
            }

            self.db.commit(None, &mutations).await?;
        }

        if !fanout.remote.is_empty() {
            self.delivery.wake();
        }

        for recipient in &fanout.local {
            if let Err(error) = self.inbox.deliver_local(recipient, &activity).await {
                tracing::warn!(
                    activity_id = %activity.id,
                    recipient = %recipient,
                    error = %error,
                    "Local delivery failed"
                );
            }
        }

        ACTIVITIES_SENT
            .with_label_values(&[activity.kind().as_str()])
            .inc();
        tracing::info!(
            activity_id = %activity.id,
            activity_type = activity.kind().as_str(),
            actor = %actor_iri,
            remote_recipients = fanout.remote.len(),
            local_recipients = fanout.local.len(),
            "Accepted outbox activity"
        );

        Ok(activity)
    }

    /// Fill in server-assigned fields and expand client shorthands
    async fn normalize(&self, actor_iri: &str, submitted: Value) -> Result<Value, AppError> {
        let Value::Object(mut map) = submitted else {
            return Err(AppError::Validation(
                "Activity must be a JSON object".to_string(),
            ));
        };

        let submitted_type = type_of(&map)?;
        if ObjectType::from_str(&submitted_type).is_some() {
            map = wrap_in_create(map);
        }

        ensure_actor(&map, "actor", actor_iri)?;
        let now = Utc::now();
        map.remove("@context");
        map.insert("id".to_string(), json!(self.directory.new_activity_iri()));
        map.insert("actor".to_string(), json!(actor_iri));
        map.insert("published".to_string(), json!(format_timestamp(now)));

        match type_of(&map)?.as_str() {
            "Create" => {
                if !map.contains_key("to") && !map.contains_key("cc") {
                    map.insert("to".to_string(), json!([PUBLIC_COLLECTION]));
                    map.insert(
                        "cc".to_string(),
                        json!([format!("{}/followers", actor_iri)]),
                    );
                }
                let audience = (map.get("to").cloned(), map.get("cc").cloned());
                let object = embedded_object(&mut map)?;
                ensure_actor(object, "attributedTo", actor_iri)?;
                object.insert("id".to_string(), json!(self.directory.new_object_iri()));
                object.insert("attributedTo".to_string(), json!(actor_iri));
                object
                    .entry("published")
                    .or_insert_with(|| json!(format_timestamp(now)));
                if let (Some(to), false) = (audience.0, object.contains_key("to")) {
                    object.insert("to".to_string(), to);
                }
                if let (Some(cc), false) = (audience.1, object.contains_key("cc")) {
                    object.insert("cc".to_string(), cc);
                }
            }
            "Update" => {
                let object = embedded_object(&mut map)?;
                ensure_actor(object, "attributedTo", actor_iri)?;
                object.insert("attributedTo".to_string(), json!(actor_iri));
                object.insert("updated".to_string(), json!(format_timestamp(now)));
                if !object.contains_key("published") {
                    let iri = object.get("id").and_then(Value::as_str).unwrap_or_default();
                    let stored = self.db.get_object(iri).await?.ok_or(AppError::NotFound)?;
                    object.insert(
                        "published".to_string(),
                        json!(format_timestamp(stored.published)),
                    );
                }
            }
            "Share" => {
                map.insert("type".to_string(), json!("Announce"));
            }
            "Unfollow" => {
                let target = object_id(&map)?;
                let follow = self
                    .db
                    .get_follow(actor_iri, &target)
                    .await?
                    .ok_or(AppError::NotFound)?;
                map.insert("type".to_string(), json!("Undo"));
                map.insert("object".to_string(), self.follow_document(&follow));
                map.entry("to").or_insert_with(|| json!([target]));
            }
            "Unlike" => {
                let target = object_id(&map)?;
                let reaction = self
                    .db
                    .find_reaction(ReactionKind::Like, actor_iri, &target)
                    .await?
                    .ok_or(AppError::NotFound)?;
                map.insert("type".to_string(), json!("Undo"));
                map.insert("object".to_string(), reaction_document(&reaction));
            }
            "Undo" => {
                if let Some(Value::String(iri)) = map.get("object").cloned() {
                    let document = if let Some(follow) = self.db.get_follow_by_activity(&iri).await? {
                        self.follow_document(&follow)
                    } else if let Some(reaction) = self.db.get_reaction(&iri).await? {
                        reaction_document(&reaction)
                    } else {
                        return Err(AppError::NotFound);
                    };
                    map.insert("object".to_string(), document);
                }
            }
            "Accept" | "Reject" => {
                if let Some(Value::String(iri)) = map.get("object").cloned() {
                    let follow = self
                        .db
                        .get_follow_by_activity(&iri)
                        .await?
                        .ok_or(AppError::NotFound)?;
                    map.insert("object".to_string(), self.follow_document(&follow));
                }
            }
            _ => {}
        }

        Ok(Value::Object(map))
    }

    fn follow_document(&self, follow: &FollowRelationship) -> Value {
        let id = follow
            .follow_activity_id
            .clone()
            .unwrap_or_else(|| self.directory.activity_iri(&follow.id));
        json!({
            "id": id,
            "type": "Follow",
            "actor": follow.follower,
            "object": follow.followee,
        })
    }

    /// Lookups and authorization checks that need no lock
    async fn prepare(&self, actor_iri: &str, activity: &Activity) -> Result<Prepared, AppError> {
        let mut prepared = Prepared::default();

        match &activity.body {
            ActivityBody::Follow { object } => {
                if object == actor_iri {
                    return Err(AppError::Validation("An actor cannot follow itself".to_string()));
                }
                if let Some(handle) = self.directory.local_handle(object) {
                    self.directory.require_local_actor(handle).await?;
                }
                prepared.follow = Some((actor_iri.to_string(), object.clone()));
                prepared.direct.push(object.clone());
            }
            ActivityBody::Undo { object } => {
                let inner = object.embedded().ok_or(AppError::NotFound)?;
                if inner.actor != actor_iri {
                    return Err(AppError::ActorMismatch(format!(
                        "{} cannot undo an activity by {}",
                        actor_iri, inner.actor
                    )));
                }
                match &inner.body {
                    ActivityBody::Follow { object: followee } => {
                        prepared.follow = Some((actor_iri.to_string(), followee.clone()));
                        prepared.direct.push(followee.clone());
                    }
                    ActivityBody::Like { object: target } | ActivityBody::Announce { object: target } => {
                        let reaction = match self.db.get_reaction(&inner.id).await? {
                            Some(reaction) => reaction,
                            None => {
                                let kind = match inner.kind() {
                                    ActivityType::Announce => ReactionKind::Announce,
                                    _ => ReactionKind::Like,
                                };
                                self.db
                                    .find_reaction(kind, actor_iri, target.iri())
                                    .await?
                                    .ok_or(AppError::NotFound)?
                            }
                        };
                        if let Some(owner) = self.object_owner(&reaction.object_iri).await {
                            prepared.direct.push(owner);
                        }
                        prepared.reaction = Some(reaction);
                    }
                    _ => {
                        return Err(AppError::Validation(format!(
                            "Undo of {} is not supported",
                            inner.kind().as_str()
                        )));
                    }
                }
            }
            ActivityBody::Accept { object } | ActivityBody::Reject { object } => {
                let inner = object.embedded().ok_or(AppError::NotFound)?;
                let ActivityBody::Follow { object: followee } = &inner.body else {
                    return Err(AppError::Validation(
                        "Only follow requests can be accepted or rejected".to_string(),
                    ));
                };
                if followee != actor_iri {
                    return Err(AppError::ActorMismatch(format!(
                        "{} cannot answer a follow of {}",
                        actor_iri, followee
                    )));
                }
                if self.db.get_follow(&inner.actor, followee).await?.is_none() {
                    return Err(AppError::NotFound);
                }
                prepared.follow = Some((inner.actor.clone(), followee.clone()));
                prepared.direct.push(inner.actor.clone());
            }
            ActivityBody::Like { object } | ActivityBody::Announce { object } => {
                if let Some(owner) = self.object_owner(object.iri()).await {
                    prepared.direct.push(owner);
                }
            }
            ActivityBody::Create { .. } | ActivityBody::Update { .. } | ActivityBody::Delete { .. } => {}
        }

        Ok(prepared)
    }

    /// Attributed actor of an object, when it can be dereferenced
    async fn object_owner(&self, iri: &str) -> Option<String> {
        match self.directory.fetch_object(iri).await {
            Ok(object) => Some(object.attributed_to),
            Err(error) => {
                tracing::warn!(object = %iri, error = %error, "Could not resolve object owner");
                None
            }
        }
    }

    /// Split the recipient set into remote inboxes and local handles
    async fn fanout(
        &self,
        sender_handle: &str,
        actor_iri: &str,
        activity: &Activity,
        prepared: &Prepared,
    ) -> Result<Fanout, AppError> {
        let followers_iri = self.directory.collection_iri(sender_handle, "followers");

        let mut include_followers = matches!(
            activity.kind(),
            ActivityType::Create | ActivityType::Update | ActivityType::Delete | ActivityType::Announce
        );
        let mut direct: Vec<String> = prepared.direct.clone();
        for iri in activity.audience() {
            if iri == PUBLIC_COLLECTION || iri == followers_iri {
                include_followers = true;
            } else if self.directory.followers_collection_owner(iri).is_none() {
                direct.push(iri.to_string());
            }
        }

        let mut candidates: Vec<(String, DeliveryAudience)> = direct
            .into_iter()
            .map(|iri| (iri, DeliveryAudience::Direct))
            .collect();
        if include_followers {
            for follower in self.db.accepted_follower_iris(actor_iri).await? {
                candidates.push((follower, DeliveryAudience::Followers));
            }
        }

        let mut fanout = Fanout::default();
        let mut seen = BTreeSet::new();
        for (iri, audience) in candidates {
            if iri == actor_iri || !seen.insert(iri.clone()) {
                continue;
            }
            if let Some(handle) = self.directory.local_handle(&iri) {
                fanout.local.push(handle.to_string());
                continue;
            }
            match self.directory.resolve_actor(&iri).await {
                Ok(actor) => fanout.remote.push(DeliveryRecipient {
                    actor: Some(actor.iri),
                    inbox: actor.inbox,
                    audience,
                }),
                Err(error) => {
                    tracing::warn!(recipient = %iri, error = %error, "Skipping unresolvable recipient");
                }
            }
        }

        Ok(fanout)
    }

    /// Local side effect of an activity; runs under the entity locks
    async fn plan(
        &self,
        actor_iri: &str,
        activity: &Activity,
        prepared: &Prepared,
    ) -> Result<Vec<Mutation>, AppError> {
        let mut mutations = Vec::new();
        let now = Utc::now();

        match &activity.body {
            ActivityBody::Create { object } => {
                mutations.push(Mutation::InsertObject(stored_object(object, true)));
            }
            ActivityBody::Update { object } => {
                let stored = self
                    .db
                    .get_object(&object.id)
                    .await?
                    .filter(|stored| !stored.is_deleted())
                    .ok_or(AppError::NotFound)?;
                if stored.attributed_to != actor_iri {
                    return Err(AppError::ActorMismatch(format!(
                        "{} does not own {}",
                        actor_iri, object.id
                    )));
                }
                mutations.push(Mutation::ReplaceObject {
                    iri: object.id.clone(),
                    attributed_to: actor_iri.to_string(),
                    document: object.to_value().to_string(),
                    updated_at: object.updated.unwrap_or(now),
                });
            }
            ActivityBody::Delete { object } => {
                let iri = object.iri();
                if iri == actor_iri {
                    return Err(AppError::Validation(
                        "Account deletion is not handled through the outbox".to_string(),
                    ));
                }
                let stored = self
                    .db
                    .get_object(iri)
                    .await?
                    .filter(|stored| !stored.is_deleted())
                    .ok_or(AppError::NotFound)?;
                if stored.attributed_to != actor_iri {
                    return Err(AppError::ActorMismatch(format!(
                        "{} does not own {}",
                        actor_iri, iri
                    )));
                }
                let tombstone = Tombstone {
                    id: iri.to_string(),
                    former_type: Some(stored.object_type.clone()),
                    deleted: Some(now),
                };
                mutations.push(Mutation::TombstoneObject {
                    iri: iri.to_string(),
                    attributed_to: actor_iri.to_string(),
                    tombstone: tombstone.to_value().to_string(),
                    deleted_at: now,
                });
            }
            ActivityBody::Follow { object } => {
                mutations.push(Mutation::RequestFollow {
                    follower: actor_iri.to_string(),
                    followee: object.clone(),
                    follow_activity_id: activity.id.clone(),
                    status: FollowStatus::Pending,
                });
            }
            ActivityBody::Undo { .. } => {
                if let Some((follower, followee)) = &prepared.follow {
                    mutations.push(Mutation::RemoveFollow {
                        follower: follower.clone(),
                        followee: followee.clone(),
                    });
                }
                if let Some(reaction) = &prepared.reaction {
                    mutations.push(Mutation::RemoveReaction {
                        activity_id: reaction.activity_id.clone(),
                        actor: reaction.actor.clone(),
                    });
                }
            }
            ActivityBody::Accept { .. } => {
                if let Some((follower, followee)) = &prepared.follow {
                    mutations.push(Mutation::TransitionFollow {
                        follower: follower.clone(),
                        followee: followee.clone(),
                        from: FollowStatus::Pending,
                        to: FollowStatus::Accepted,
                    });
                }
            }
            ActivityBody::Reject { .. } => {
                if let Some((follower, followee)) = &prepared.follow {
                    // Rejecting an accepted follower removes them
                    for from in [FollowStatus::Pending, FollowStatus::Accepted] {
                        mutations.push(Mutation::TransitionFollow {
                            follower: follower.clone(),
                            followee: followee.clone(),
                            from,
                            to: FollowStatus::Rejected,
                        });
                    }
                }
            }
            ActivityBody::Like { object } | ActivityBody::Announce { object } => {
                let kind = match activity.kind() {
                    ActivityType::Announce => ReactionKind::Announce,
                    _ => ReactionKind::Like,
                };
                mutations.push(Mutation::InsertReaction(Reaction {
                    activity_id: activity.id.clone(),
                    kind,
                    actor: actor_iri.to_string(),
                    object_iri: object.iri().to_string(),
                    created_at: now,
                }));
            }
        }

        Ok(mutations)
    }
}

fn lock_keys(activity: &Activity, prepared: &Prepared) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some((follower, followee)) = &prepared.follow {
        keys.push(follow_key(follower, followee));
    }
    if let Some(reaction) = &prepared.reaction {
        keys.push(object_key(&reaction.object_iri));
    }
    match &activity.body {
        ActivityBody::Create { .. }
        | ActivityBody::Update { .. }
        | ActivityBody::Delete { .. }
        | ActivityBody::Like { .. }
        | ActivityBody::Announce { .. } => keys.push(object_key(activity.object_iri())),
        _ => {}
    }
    keys
}

fn type_of(map: &Map<String, Value>) -> Result<String, AppError> {
    map.get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Missing `type`".to_string()))
}

/// `{"type":"Note",...}` becomes `{"type":"Create","object":{"type":"Note",...}}`
fn wrap_in_create(mut object: Map<String, Value>) -> Map<String, Value> {
    object.remove("@context");
    let mut activity = Map::new();
    activity.insert("type".to_string(), json!("Create"));
    for key in ["to", "cc"] {
        if let Some(value) = object.get(key) {
            activity.insert(key.to_string(), value.clone());
        }
    }
    activity.insert("object".to_string(), Value::Object(object));
    activity
}

/// A present-but-different actor field is a mismatch, never silently replaced
fn ensure_actor(map: &Map<String, Value>, key: &str, actor_iri: &str) -> Result<(), AppError> {
    let claimed = match map.get(key) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::String(iri)) => iri.as_str(),
        Some(Value::Object(inner)) => inner.get("id").and_then(Value::as_str).unwrap_or_default(),
        Some(_) => "",
    };
    if claimed == actor_iri {
        Ok(())
    } else {
        Err(AppError::ActorMismatch(format!(
            "{} `{}` is not the submitting actor {}",
            key, claimed, actor_iri
        )))
    }
}

fn embedded_object(map: &mut Map<String, Value>) -> Result<&mut Map<String, Value>, AppError> {
    match map.get_mut("object") {
        Some(Value::Object(object)) => {
            object.remove("@context");
            Ok(object)
        }
        _ => Err(AppError::Validation(
            "`object` must be an embedded object".to_string(),
        )),
    }
}

fn object_id(map: &Map<String, Value>) -> Result<String, AppError> {
    match map.get("object") {
        Some(Value::String(iri)) => Ok(iri.clone()),
        Some(Value::Object(inner)) => inner
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("`object` has no id".to_string())),
        _ => Err(AppError::Validation("Missing `object`".to_string())),
    }
}

fn reaction_document(reaction: &Reaction) -> Value {
    let kind = match reaction.kind {
        ReactionKind::Like => "Like",
        ReactionKind::Announce => "Announce",
    };
    json!({
        "id": reaction.activity_id,
        "type": kind,
        "actor": reaction.actor,
        "object": reaction.object_iri,
    })
}
