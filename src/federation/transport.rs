//! Outbound HTTP transport
//!
//! Every request to another server (actor discovery, object dereference,
//! inbox delivery) goes through [`Transport`]. The production implementation
//! wraps `reqwest` and refuses to talk to local or private destinations.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppError;

/// Accept header used when dereferencing ActivityPub documents
pub const ACTIVITY_JSON_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Send a request, get status and body back
///
/// Errors are reserved for requests that never produced a status (refused
/// destination, DNS failure, connect error, timeout).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, accept: &str) -> Result<TransportResponse, AppError>;

    async fn post(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<TransportResponse, AppError>;
}

/// `reqwest`-backed transport with SSRF guards
pub struct HttpTransport {
    client: reqwest::Client,
    allow_private: bool,
}

impl HttpTransport {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        allow_private: bool,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            client,
            allow_private,
        })
    }

    async fn check_destination(&self, url: &str) -> Result<url::Url, AppError> {
        let parsed =
            url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Forbidden(format!(
                    "unsupported URL scheme: {}",
                    scheme
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
            .to_string();

        if self.allow_private {
            return Ok(parsed);
        }

        if is_disallowed_host(&host) {
            return Err(AppError::Forbidden(host));
        }

        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
        validate_resolved_host_ips(&host, port).await?;

        Ok(parsed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, accept: &str) -> Result<TransportResponse, AppError> {
        let url = self.check_destination(url).await?;

        let response = self
            .client
            .get(url)
            .header("Accept", accept)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }

    async fn post(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<TransportResponse, AppError> {
        let url = self.check_destination(url).await?;

        let mut request = self.client.post(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Fetch(format!("Failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden(host.to_string()));
        }
    }

    if !resolved_any {
        return Err(AppError::Fetch(format!("No DNS records for {}", host)));
    }

    Ok(())
}
