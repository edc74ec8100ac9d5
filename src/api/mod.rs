//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actors, inboxes, outboxes, collections, objects)
//! - Discovery (WebFinger, NodeInfo, host-meta)
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::{ACTIVITY_JSON, accepts_activity_json, activitypub_router};
pub use metrics::{metrics_router, track_http_metrics};
pub use wellknown::wellknown_router;
