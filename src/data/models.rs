//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

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
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actors
// =============================================================================

/// An actor hosted on this server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    /// RSA private key (PKCS#8 PEM)
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    /// RSA public key (SPKI PEM)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the account is removed; the row is kept so IRIs stay reserved
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A remote actor document cached after discovery
///
/// `public_key_id`, `public_key_pem` and `fetched_at` are the persisted
/// form of the remote key cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    pub iri: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub shared_inbox: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
    pub fetched_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Content
// =============================================================================

/// A Note, Article or JobPosting, local or remote
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredObject {
    pub iri: String,
    pub object_type: String,
    pub attributed_to: String,
    pub in_reply_to: Option<String>,
    /// Serialized object JSON (a Tombstone once deleted)
    pub document: String,
    pub is_local: bool,
    pub published: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FollowStatus {
    Pending,
    Accepted,
    Rejected,
}

/// (follower, followee) pair; unique per pair
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRelationship {
    pub id: String,
    pub follower: String,
    pub followee: String,
    pub status: FollowStatus,
    /// IRI of the Follow activity that opened (or last re-opened) the request
    pub follow_activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Collections
// =============================================================================

/// Receipt of an inbound activity for one local recipient
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedActivity {
    pub activity_id: String,
    pub recipient: String,
    pub activity_type: String,
    pub actor: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxItem {
    pub id: String,
    /// Local recipient handle
    pub recipient: String,
    pub activity_id: String,
    pub activity_type: String,
    pub actor: String,
    pub document: String,
    pub published: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxItem {
    pub activity_id: String,
    pub actor_handle: String,
    pub activity_type: String,
    pub object_iri: Option<String>,
    pub document: String,
    pub published: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Announce,
}

/// A Like or Announce recorded against an object
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reaction {
    pub activity_id: String,
    pub kind: ReactionKind,
    pub actor: String,
    pub object_iri: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Abandoned,
}

/// Why a recipient was chosen; followers-audience tasks are pruned when the
/// relationship goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryAudience {
    Followers,
    Direct,
}

/// One activity bound for one remote inbox
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: String,
    pub activity_id: String,
    pub sender_handle: String,
    pub recipient_actor: Option<String>,
    pub recipient_inbox: String,
    pub audience: DeliveryAudience,
    /// Serialized activity, signed fresh on every attempt
    pub payload: String,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub last_status_code: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryTask {
    /// New pending task due immediately
    pub fn new(
        activity_id: &str,
        sender_handle: &str,
        recipient_actor: Option<&str>,
        recipient_inbox: &str,
        audience: DeliveryAudience,
        payload: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            activity_id: activity_id.to_string(),
            sender_handle: sender_handle.to_string(),
            recipient_actor: recipient_actor.map(str::to_string),
            recipient_inbox: recipient_inbox.to_string(),
            audience,
            payload: payload.to_string(),
            attempts: 0,
            next_attempt_at: now,
            status: DeliveryStatus::Pending,
            last_status_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub pending: i64,
    pub delivered: i64,
    pub abandoned: i64,
}

// =============================================================================
// Atomic effects
// =============================================================================

/// A single store change produced by inbox or outbox processing.
///
/// Processors compute the full list up front; [`super::Database::commit`]
/// applies it in one transaction together with the dedupe receipt.
/// Every variant is idempotent under the table's unique keys.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Open a follow request, or re-open a rejected one. Accepted pairs are left alone.
    RequestFollow {
        follower: String,
        followee: String,
        follow_activity_id: String,
        status: FollowStatus,
    },
    /// Conditional status transition (no-op unless the pair is currently `from`)
    TransitionFollow {
        follower: String,
        followee: String,
        from: FollowStatus,
        to: FollowStatus,
    },
    RemoveFollow {
        follower: String,
        followee: String,
    },
    /// Drop every relationship the actor takes part in
    RemoveFollowsOf {
        actor: String,
    },
    InsertObject(StoredObject),
    /// Replace a live object's document; owner must match
    ReplaceObject {
        iri: String,
        attributed_to: String,
        document: String,
        updated_at: DateTime<Utc>,
    },
    /// Swap a live object's document for a tombstone; owner must match
    TombstoneObject {
        iri: String,
        attributed_to: String,
        tombstone: String,
        deleted_at: DateTime<Utc>,
    },
    InsertReaction(Reaction),
    RemoveReaction {
        activity_id: String,
        actor: String,
    },
    TombstoneRemoteActor {
        iri: String,
    },
    AppendInbox(InboxItem),
    AppendOutbox(OutboxItem),
    EnqueueDelivery(DeliveryTask),
}
