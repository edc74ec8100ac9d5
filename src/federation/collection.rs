//! Collection paginator
//!
//! Renders inbox, outbox, followers and following as paged
//! `OrderedCollectionPage` documents.

use std::sync::Arc;

use serde_json::{Value, json};

use super::activity::ACTIVITYSTREAMS_CONTEXT;
use super::actor::ActorDirectory;
use crate::data::Database;
use crate::error::AppError;

/// Items per page
pub const PAGE_SIZE: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Inbox,
    Outbox,
    Followers,
    Following,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Outbox => "outbox",
            Self::Followers => "followers",
            Self::Following => "following",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(Self::Inbox),
            "outbox" => Some(Self::Outbox),
            "followers" => Some(Self::Followers),
            "following" => Some(Self::Following),
            _ => None,
        }
    }
}

/// Page number from a raw `page` query value; anything unusable becomes 1
pub fn page_number(raw: Option<&str>) -> i64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|page| *page >= 1)
        .unwrap_or(1)
}

pub struct CollectionPaginator {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
}

impl CollectionPaginator {
    pub fn new(db: Arc<Database>, directory: Arc<ActorDirectory>) -> Self {
        Self { db, directory }
    }

    /// Page of a collection addressed by IRI
    pub async fn page(&self, collection_iri: &str, page: i64) -> Result<Value, AppError> {
        let (owner, name) = collection_iri
            .rsplit_once('/')
            .ok_or(AppError::NotFound)?;
        let handle = self.directory.local_handle(owner).ok_or(AppError::NotFound)?;
        let kind = CollectionKind::from_str(name).ok_or(AppError::NotFound)?;
        self.page_for(handle, kind, page).await
    }

    /// Page `page` (1-based) of one of a local actor's collections
    pub async fn page_for(
        &self,
        handle: &str,
        kind: CollectionKind,
        page: i64,
    ) -> Result<Value, AppError> {
        if page < 1 {
            return Err(AppError::Validation(format!(
                "page must be at least 1, got {}",
                page
            )));
        }

        let actor = self.directory.get_local_actor(handle).await?;
        let actor_iri = self.directory.actor_iri(&actor.handle);
        let offset = (page - 1).saturating_mul(PAGE_SIZE);

        let (total, items) = match kind {
            CollectionKind::Inbox => {
                let total = self.db.count_inbox(&actor.handle).await?;
                let items = self
                    .db
                    .list_inbox(&actor.handle, PAGE_SIZE, offset)
                    .await?
                    .into_iter()
                    .map(|item| stored_document(&item.document, &item.activity_id))
                    .collect();
                (total, items)
            }
            CollectionKind::Outbox => {
                let total = self.db.count_outbox(&actor.handle).await?;
                let items = self
                    .db
                    .list_outbox(&actor.handle, PAGE_SIZE, offset)
                    .await?
                    .into_iter()
                    .map(|item| stored_document(&item.document, &item.activity_id))
                    .collect();
                (total, items)
            }
            CollectionKind::Followers => {
                let total = self.db.count_followers(&actor_iri).await?;
                let items = self
                    .db
                    .list_followers(&actor_iri, PAGE_SIZE, offset)
                    .await?
                    .into_iter()
                    .map(|follow| Value::String(follow.follower))
                    .collect();
                (total, items)
            }
            CollectionKind::Following => {
                let total = self.db.count_following(&actor_iri).await?;
                let items = self
                    .db
                    .list_following(&actor_iri, PAGE_SIZE, offset)
                    .await?
                    .into_iter()
                    .map(|follow| Value::String(follow.followee))
                    .collect();
                (total, items)
            }
        };

        let collection_iri = self.directory.collection_iri(&actor.handle, kind.as_str());
        Ok(render_page(&collection_iri, page, total, items))
    }
}

/// Stored JSON, or the bare IRI if the row is unreadable
fn stored_document(document: &str, id: &str) -> Value {
    match serde_json::from_str::<Value>(document) {
        Ok(Value::Object(mut map)) => {
            // Items are embedded in the page, which carries the context
            map.remove("@context");
            Value::Object(map)
        }
        _ => {
            tracing::warn!(id = %id, "Unreadable stored activity, listing by reference");
            Value::String(id.to_string())
        }
    }
}

/// Build an `OrderedCollectionPage`
pub fn render_page(collection_iri: &str, page: i64, total: i64, items: Vec<Value>) -> Value {
    let mut document = json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": format!("{}?page={}", collection_iri, page),
        "type": "OrderedCollectionPage",
        "partOf": collection_iri,
        "totalItems": total,
        "orderedItems": items,
    });

    if let Value::Object(map) = &mut document {
        if page > 1 {
            map.insert(
                "prev".to_string(),
                json!(format!("{}?page={}", collection_iri, page - 1)),
            );
        }
        if page.saturating_mul(PAGE_SIZE) < total {
            map.insert(
                "next".to_string(),
                json!(format!("{}?page={}", collection_iri, page + 1)),
            );
        }
    }

    document
}
