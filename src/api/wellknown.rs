//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::error::AppError;

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain (or the actor IRI)
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let resource = query
        .resource
        .filter(|resource| !resource.trim().is_empty())
        .ok_or_else(|| AppError::Validation("resource parameter is required".to_string()))?;

    let jrd = state.directory.webfinger(resource.trim()).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        Json(jrd),
    )
        .into_response())
}

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.directory.nodeinfo_links())
}

/// GET /nodeinfo/2.0
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(state.directory.node_info().await?))
}

/// GET /.well-known/host-meta
///
/// XRD by default; JRD when the client asks for JSON.
async fn host_meta(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let template = format!(
        "{}/.well-known/webfinger?resource={{uri}}",
        state.directory.base_url()
    );

    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    if wants_json {
        return Json(json!({
            "links": [{ "rel": "lrdd", "template": template }]
        }))
        .into_response();
    }

    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}"/>
</XRD>"#,
        html_escape::encode_double_quoted_attribute(&template)
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml).into_response()
}
