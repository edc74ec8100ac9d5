//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Actor documents, discovery and key resolution
//! - Activity parsing and serialization
//! - Inbox and outbox processing
//! - Durable delivery with retry
//! - Collection paging

pub mod activity;
pub mod actor;
pub mod collection;
pub mod delivery;
pub mod inbox;
pub mod key_cache;
pub mod locks;
pub mod outbox;
pub mod signature;
pub mod transport;
pub mod webfinger;

pub use activity::{Activity, ActivityBody, ActivityType, Object, ObjectType, Reference, Tombstone};
pub use actor::{Actor, ActorDirectory, is_valid_handle};
pub use collection::{CollectionKind, CollectionPaginator, PAGE_SIZE, page_number};
pub use delivery::{AttemptOutcome, DeliveryEngine, DeliveryRecipient};
pub use inbox::{InboxOutcome, InboxProcessor};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use locks::EntityLocks;
pub use outbox::OutboxProcessor;
pub use signature::{PublicKeyResolver, sign_request, verify_request, verify_signature};
pub use transport::{HttpTransport, Transport, TransportResponse};
pub use webfinger::{WebFingerResponse, generate_webfinger_response};

/// Strip unsafe markup from HTML that arrived over federation
pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}
