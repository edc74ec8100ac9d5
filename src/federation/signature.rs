//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::{AppError, SignatureError};

/// Sign an HTTP request
///
/// Creates HTTP Signature header for outgoing requests.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Returns
/// Headers to add: Host, Date, Signature and Digest (if body present)
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/users/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)?;

    let path = parsed_url.path();
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };

    // 2. Generate Date header (RFC 2822 format)
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Generate Digest if body present
    let digest = body.map(generate_digest);

    // 4. Build signing string
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];

    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    // 5. Sign with RSA-SHA256
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        host,
        signature: signature_header,
        date,
        digest,
    })
}

/// `host[:port]` as the receiving server will see it
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    // `port()` is None when the port is the scheme default
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Host header value that was signed
    pub host: String,
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

impl SignatureHeaders {
    /// Flatten into (name, value) pairs for the transport
    pub fn into_pairs(self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("Host".to_string(), self.host),
            ("Date".to_string(), self.date),
            ("Signature".to_string(), self.signature),
        ];
        if let Some(digest) = self.digest {
            pairs.push(("Digest".to_string(), digest));
        }
        pairs
    }
}

/// Verify an HTTP request signature against a known public key
///
/// Checks run in order: signature header shape, Date freshness, body
/// digest, then the RSA signature itself.
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path (with query, as received)
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `max_skew` - Accepted distance between Date and now
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew: Duration,
) -> Result<(), SignatureError> {
    // 1. Parse Signature header
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::MissingHeader(format!(
            "unsupported algorithm {}",
            parsed.algorithm
        )));
    }

    let mut required = vec!["(request-target)", "host", "date"];
    if body.is_some() {
        required.push("digest");
    }
    for name in required {
        if !parsed.headers.iter().any(|h| h == name) {
            return Err(SignatureError::MissingHeader(format!(
                "{} is not signed",
                name
            )));
        }
    }

    // 3. Verify Date is recent.
    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| SignatureError::MissingHeader("date".to_string()))?;

    let diff = (Utc::now().timestamp() - date.timestamp()).unsigned_abs();
    if diff > max_skew.as_secs() {
        return Err(SignatureError::Expired);
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    // 5. Reconstruct signing string from the received headers.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name => header_str(headers, name)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::MissingHeader("signature is not base64".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|_| SignatureError::UnknownKeyId(parsed.key_id.clone()))?;

    // EMSA-PKCS1-v1_5 with the SHA-256 DigestInfo prefix (rsa-sha256)
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::CryptoMismatch)?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::CryptoMismatch)
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SignatureError::MissingHeader(name.to_string()))
}

/// A public key and the actor that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key_id: String,
    pub owner: String,
    pub pem: String,
    /// Served from a cache rather than fetched just now
    pub cached: bool,
}

/// Looks up signing keys by key id
#[async_trait]
pub trait PublicKeyResolver: Send + Sync {
    /// Cached key if known, fetched otherwise
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey, AppError>;

    /// Always refetch, replacing any cached entry
    async fn refresh(&self, key_id: &str) -> Result<ResolvedKey, AppError>;
}

/// Authenticate an inbound request
///
/// Resolves the signing key, verifies, and returns the IRI of the actor that
/// owns the key. A signature that fails against a cached key gets exactly one
/// retry against a freshly fetched key, to follow key rotation.
pub async fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    resolver: &dyn PublicKeyResolver,
    max_skew: Duration,
) -> Result<String, AppError> {
    let key_id = parse_signature_header(header_str(headers, "signature")?)?.key_id;

    let key = resolver
        .resolve(&key_id)
        .await
        .map_err(|e| key_resolution_error(&key_id, e))?;

    match verify_signature(method, path, headers, Some(body), &key.pem, max_skew) {
        Ok(()) => Ok(key.owner),
        Err(SignatureError::CryptoMismatch) if key.cached => {
            tracing::info!(key_id = %key_id, "Signature failed against cached key, refreshing");
            let fresh = resolver
                .refresh(&key_id)
                .await
                .map_err(|e| key_resolution_error(&key_id, e))?;
            verify_signature(method, path, headers, Some(body), &fresh.pem, max_skew)?;
            Ok(fresh.owner)
        }
        Err(e) => Err(e.into()),
    }
}

/// Store failures stay internal; anything else means we could not get a key.
fn key_resolution_error(key_id: &str, error: AppError) -> AppError {
    match error {
        AppError::Database(_) | AppError::Internal(_) => error,
        AppError::Signature(inner) => AppError::Signature(inner),
        other => {
            tracing::warn!(key_id = %key_id, error = %other, "Failed to resolve signing key");
            AppError::Signature(SignatureError::UnknownKeyId(key_id.to_string()))
        }
    }
}

/// Actor IRI a key id belongs to (the key id minus its fragment)
pub fn key_owner_iri(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Values are quoted; base64 padding keeps its '=' because we split once
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let missing = |field: &str| SignatureError::MissingHeader(format!("signature {}", field));

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        // Absent algorithm means the key decides, which for us is always RSA
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        // Absent headers list defaults to just Date
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
