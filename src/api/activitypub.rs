//! ActivityPub endpoints
//!
//! - Actor documents
//! - Inbox (signed server-to-server delivery) and outbox (local submission)
//! - Paged inbox, outbox, followers and following collections
//! - Object and activity lookup, with tombstones for deleted objects

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{CollectionKind, page_number};

pub const ACTIVITY_JSON: &str = "application/activity+json";
const LD_JSON: &str = "application/ld+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:handle - Actor document
/// - GET|POST /users/:handle/inbox - Inbox collection / S2S delivery
/// - GET|POST /users/:handle/outbox - Outbox collection / local submission
/// - GET /users/:handle/followers - Followers collection
/// - GET /users/:handle/following - Following collection
/// - GET /posts/:id - Local object (410 once deleted)
/// - GET /activities/:id - Local activity
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:handle", get(actor))
        .route("/users/:handle/inbox", get(inbox_collection).post(inbox))
        .route("/users/:handle/outbox", get(outbox_collection).post(outbox))
        .route("/users/:handle/followers", get(followers))
        .route("/users/:handle/following", get(following))
        .route("/posts/:id", get(object))
        .route("/activities/:id", get(activity))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<String>,
}

impl PageQuery {
    fn number(&self) -> i64 {
        page_number(self.page.as_deref())
    }
}

/// JSON body served as `application/activity+json`
struct ActivityJson(Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        (
            [(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON))],
            self.0.to_string(),
        )
            .into_response()
    }
}

fn is_activity_media_type(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or("").trim();
    essence.eq_ignore_ascii_case(ACTIVITY_JSON) || essence.eq_ignore_ascii_case(LD_JSON)
}

/// Whether the Accept header names an ActivityStreams media type
pub fn accepts_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(is_activity_media_type)
}

fn require_accept(headers: &HeaderMap) -> Result<(), AppError> {
    if accepts_activity_json(headers) {
        Ok(())
    } else {
        Err(AppError::NotAcceptable)
    }
}

fn require_content_type(headers: &HeaderMap) -> Result<(), AppError> {
    let supported = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_activity_media_type);
    if supported {
        Ok(())
    } else {
        Err(AppError::UnsupportedMediaType)
    }
}

/// GET /users/:handle
///
/// Serves the actor document, or a `Tombstone` with 410 once the actor
/// has been deleted.
async fn actor(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_accept(&headers)?;

    match state.directory.get_local_actor(&handle).await {
        Ok(actor) => Ok(ActivityJson(state.directory.actor_document(&actor)).into_response()),
        Err(AppError::Gone) => {
            let tombstone = state.directory.actor_tombstone(&handle).await?;
            Ok((StatusCode::GONE, ActivityJson(tombstone)).into_response())
        }
        Err(error) => Err(error),
    }
}

/// POST /users/:handle/inbox
///
/// Accepts a signed activity. Duplicates are acknowledged the same way
/// as first deliveries.
async fn inbox(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    require_content_type(&headers)?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let outcome = state
        .inbox
        .handle_inbox(&handle, "POST", &path, &headers, &body)
        .await?;
    tracing::debug!(recipient = %handle, outcome = outcome.as_str(), "Inbox POST handled");

    Ok(StatusCode::ACCEPTED)
}

/// POST /users/:handle/outbox
///
/// Callers are expected to be authenticated in front of this router.
async fn outbox(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    require_content_type(&headers)?;

    let activity = state.outbox.handle_outbox(&handle, &body).await?;
    let location = HeaderValue::from_str(&activity.id)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid activity id: {}", e)))?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        ActivityJson(activity.to_value()),
    )
        .into_response())
}

/// GET /users/:handle/inbox
async fn inbox_collection(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    require_accept(&headers)?;
    collection_page(&state, &handle, CollectionKind::Inbox, query.number()).await
}

/// GET /users/:handle/outbox
async fn outbox_collection(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    require_accept(&headers)?;
    collection_page(&state, &handle, CollectionKind::Outbox, query.number()).await
}

/// GET /users/:handle/followers
async fn followers(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection_page(&state, &handle, CollectionKind::Followers, query.number()).await
}

/// GET /users/:handle/following
async fn following(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection_page(&state, &handle, CollectionKind::Following, query.number()).await
}

async fn collection_page(
    state: &AppState,
    handle: &str,
    kind: CollectionKind,
    page: i64,
) -> Result<ActivityJson, AppError> {
    let document = state.collections.page_for(handle, kind, page).await?;
    Ok(ActivityJson(document))
}

/// GET /posts/:id
async fn object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let iri = state.directory.object_iri(&id);
    let stored = state
        .db
        .get_object(&iri)
        .await?
        .filter(|object| object.is_local)
        .ok_or(AppError::NotFound)?;

    let document: Value = serde_json::from_str(&stored.document)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Corrupt stored object {}: {}", iri, e)))?;

    if stored.is_deleted() {
        return Ok((StatusCode::GONE, ActivityJson(document)).into_response());
    }
    Ok(ActivityJson(document).into_response())
}

/// GET /activities/:id
async fn activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson, AppError> {
    let iri = state.directory.activity_iri(&id);
    let item = state
        .db
        .get_outbox_item(&iri)
        .await?
        .ok_or(AppError::NotFound)?;

    let document: Value = serde_json::from_str(&item.document).map_err(|e| {
        AppError::Internal(anyhow::anyhow!("Corrupt stored activity {}: {}", iri, e))
    })?;
    Ok(ActivityJson(document))
}
