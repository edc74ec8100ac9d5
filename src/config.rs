//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    /// Local actors provisioned at startup
    #[serde(default)]
    pub actors: Vec<LocalActorConfig>,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "jobs.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://jobs.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
    pub contact_email: String,
    /// Advertised through NodeInfo
    #[serde(default = "default_open_registrations")]
    pub open_registrations: bool,
}

fn default_open_registrations() -> bool {
    true
}

/// How inbound Follow requests are answered
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FollowPolicy {
    /// Follows stay pending until the followee posts an Accept
    #[default]
    Manual,
    /// Follows are accepted immediately and an Accept is delivered
    AutoAccept,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub follow_policy: FollowPolicy,
    /// Accepted distance between the Date header and local time
    pub clock_skew_seconds: u64,
    /// TTL for in-memory remote public keys
    pub key_cache_ttl_seconds: u64,
    /// TTL for cached remote actor documents
    pub actor_cache_ttl_seconds: u64,
    /// Timeout for outbound HTTP requests
    pub request_timeout_seconds: u64,
    /// Permit fetches and deliveries to loopback/private hosts (local testing only)
    #[serde(default)]
    pub allow_private_addresses: bool,
    pub user_agent: String,
}

impl FederationConfig {
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_seconds)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }

    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Delivery queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts before a task is abandoned
    pub max_attempts: u32,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    /// Parallel inbox POSTs per batch
    pub concurrency: usize,
    /// Tasks claimed per scheduler pass
    pub batch_size: u32,
    pub poll_interval_seconds: u64,
}

impl DeliveryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs(self.base_backoff_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

/// A local actor created (or refreshed) at startup
#[derive(Debug, Clone, Deserialize)]
pub struct LocalActorConfig {
    pub handle: String,
    pub display_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (OPENFIRM_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/openfirm.db")?
            .set_default("instance.title", "OpenFirm")?
            .set_default("instance.description", "A federated job network")?
            .set_default("instance.contact_email", "")?
            .set_default("instance.open_registrations", true)?
            .set_default("federation.follow_policy", "manual")?
            .set_default("federation.clock_skew_seconds", 300)?
            .set_default("federation.key_cache_ttl_seconds", 3600)?
            .set_default("federation.actor_cache_ttl_seconds", 86400)?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default(
                "federation.user_agent",
                format!("OpenFirm/{}", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("delivery.max_attempts", 8)?
            .set_default("delivery.base_backoff_seconds", 30)?
            .set_default("delivery.max_backoff_seconds", 21600)?
            .set_default("delivery.concurrency", 10)?
            .set_default("delivery.batch_size", 50)?
            .set_default("delivery.poll_interval_seconds", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (OPENFIRM_*)
            .add_source(
                Environment::with_prefix("OPENFIRM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must not be empty".to_string()));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if !(30..=300).contains(&self.federation.clock_skew_seconds) {
            return Err(AppError::Config(
                "federation.clock_skew_seconds must be between 30 and 300".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.delivery.base_backoff_seconds > self.delivery.max_backoff_seconds {
            return Err(AppError::Config(
                "delivery.base_backoff_seconds must not exceed delivery.max_backoff_seconds"
                    .to_string(),
            ));
        }

        if self.delivery.concurrency == 0 || self.delivery.batch_size == 0 {
            return Err(AppError::Config(
                "delivery.concurrency and delivery.batch_size must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for actor in &self.actors {
            if !crate::federation::is_valid_handle(&actor.handle) {
                return Err(AppError::Config(format!(
                    "actors: invalid handle {:?}",
                    actor.handle
                )));
            }
            if !seen.insert(actor.handle.as_str()) {
                return Err(AppError::Config(format!(
                    "actors: duplicate handle {}",
                    actor.handle
                )));
            }
        }

        if self.federation.allow_private_addresses {
            tracing::warn!("federation.allow_private_addresses is enabled; SSRF guards are off");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "a.example".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/openfirm-test.db"),
            },
            instance: InstanceConfig {
                title: "OpenFirm".to_string(),
                description: "Test instance".to_string(),
                contact_email: "admin@a.example".to_string(),
                open_registrations: true,
            },
            federation: FederationConfig {
                follow_policy: FollowPolicy::Manual,
                clock_skew_seconds: 300,
                key_cache_ttl_seconds: 3600,
                actor_cache_ttl_seconds: 86_400,
                request_timeout_seconds: 30,
                allow_private_addresses: false,
                user_agent: "OpenFirm/test".to_string(),
            },
            delivery: DeliveryConfig {
                max_attempts: 8,
                base_backoff_seconds: 30,
                max_backoff_seconds: 21_600,
                concurrency: 10,
                batch_size: 50,
                poll_interval_seconds: 5,
            },
            actors: vec![LocalActorConfig {
                handle: "alice".to_string(),
                display_name: "Alice".to_string(),
                bio: None,
                avatar_url: None,
            }],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
        assert_eq!(valid_config().server.base_url(), "https://a.example");
    }

    #[test]
    fn validate_rejects_skew_outside_window() {
        let mut config = valid_config();
        config.federation.clock_skew_seconds = 3600;

        let error = config.validate().expect_err("an hour of skew must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("clock_skew_seconds")
        ));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut config = valid_config();
        config.delivery.base_backoff_seconds = 600;
        config.delivery.max_backoff_seconds = 60;

        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_handles() {
        let mut config = valid_config();
        config.actors.push(config.actors[0].clone());

        let error = config.validate().expect_err("duplicate handles must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("duplicate handle")
        ));
    }

    #[test]
    fn validate_rejects_malformed_handle() {
        let mut config = valid_config();
        config.actors[0].handle = "Alice Smith".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn follow_policy_defaults_to_manual() {
        assert_eq!(FollowPolicy::default(), FollowPolicy::Manual);
        let parsed: FollowPolicy = serde_json::from_str("\"auto_accept\"").unwrap();
        assert_eq!(parsed, FollowPolicy::AutoAccept);
    }
}
