//! WebFinger protocol implementation
//!
//! Maps `acct:user@domain` resources to local actor IRIs. This server only
//! answers for its own domain; foreign lookups are not proxied.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// `user@domain` split out of a resource parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcctResource {
    pub user: String,
    pub domain: String,
}

/// Parse `acct:user@domain` (the `acct:` scheme is optional)
pub fn parse_acct_resource(resource: &str) -> Result<AcctResource, AppError> {
    let address = resource.strip_prefix("acct:").unwrap_or(resource);
    let address = address.strip_prefix('@').unwrap_or(address);

    let (user, domain) = address
        .split_once('@')
        .ok_or_else(|| AppError::Validation(format!("Malformed resource: {}", resource)))?;

    if user.is_empty() || domain.is_empty() || domain.contains('@') || domain.contains('/') {
        return Err(AppError::Validation(format!(
            "Malformed resource: {}",
            resource
        )));
    }

    Ok(AcctResource {
        user: user.to_string(),
        domain: domain.to_ascii_lowercase(),
    })
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - Actor IRI
/// * `base_url` - Instance base URL (includes protocol)
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
    base_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_url.to_string()),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url.to_string()),
                template: None,
            },
            WebFingerLink {
                rel: "http://ostatus.org/schema/1.0/subscribe".to_string(),
                link_type: None,
                href: None,
                template: Some(format!(
                    "{}/authorize_interaction?uri={{uri}}",
                    base_url.trim_end_matches('/')
                )),
            },
        ],
    }
}
