//! Shared fixtures for unit tests

use std::sync::Arc;

use tempfile::TempDir;

use crate::config::{
    AppConfig, DatabaseConfig, DeliveryConfig, FederationConfig, FollowPolicy, InstanceConfig,
    LoggingConfig, ServerConfig,
};
use crate::data::Database;

/// Config for an instance at `https://{domain}` with no retry delays
pub(crate) fn test_config(domain: &str) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig {
            path: "unused.db".into(),
        },
        instance: InstanceConfig {
            title: "Test Instance".to_string(),
            description: "A test instance".to_string(),
            contact_email: "admin@example.com".to_string(),
            open_registrations: false,
        },
        federation: FederationConfig {
            follow_policy: FollowPolicy::Manual,
            clock_skew_seconds: 300,
            key_cache_ttl_seconds: 3600,
            actor_cache_ttl_seconds: 3600,
            request_timeout_seconds: 5,
            allow_private_addresses: true,
            user_agent: "OpenFirm-Test/0.1".to_string(),
        },
        delivery: DeliveryConfig {
            max_attempts: 3,
            base_backoff_seconds: 0,
            max_backoff_seconds: 0,
            concurrency: 4,
            batch_size: 50,
            poll_interval_seconds: 1,
        },
        actors: Vec::new(),
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Fresh migrated database in a temporary directory
///
/// Keep the `TempDir` alive for as long as the database is used.
pub(crate) async fn test_database() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::connect(&temp_dir.path().join("test.db"))
        .await
        .expect("Failed to connect to test database");
    (temp_dir, Arc::new(db))
}
