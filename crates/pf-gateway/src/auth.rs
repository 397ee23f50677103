//! Signed identity token verification.
//!
//! Tokens are RS256 JWTs issued by the platform identity provider. The
//! validator verifies the signature against the provider's published key
//! set, fetched once and cached per key id. Fetches are rate limited so a
//! flood of tokens with bogus key ids cannot hammer the provider; when the
//! limiter denies a refresh, a stale cached key is still usable.
//!
//! Two token kinds are accepted. Access tokens carry the client in a
//! `client_id` claim and the handle in `username`; id tokens carry the
//! client in `aud` and the handle in `cognito:username`. The `token_use`
//! claim says which rules apply.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use nonzero_ext::nonzero;
use pf_common::{Identity, TokenUse};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a token was rejected. Every variant maps to a 401 at the edge; the
/// detail is for logs, never for the client.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization header is not a Bearer token")]
    MalformedHeader,

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token has expired")]
    Expired,

    #[error("Token signature verification failed")]
    SignatureInvalid,

    #[error("Claim validation failed: {0}")]
    ClaimMismatch(String),

    #[error("Key set fetch failed: {0}")]
    KeyDiscovery(String),

    #[error("No key published for kid {0}")]
    UnknownKey(String),
}

/// Extract the raw token from an `Authorization: Bearer <token>` value.
pub fn parse_bearer(header: &str) -> Result<&str, AuthError> {
    let rest = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or(AuthError::MalformedHeader)?;
    let token = rest.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Expected `iss` claim, e.g. the provider's user-pool URL.
    pub issuer: String,
    /// The app client this gateway serves; checked against `client_id`
    /// or `aud` depending on token kind.
    pub client_id: String,
    pub jwks_url: String,
    /// How long a fetched key is considered fresh.
    pub cache_ttl: Duration,
    /// Ceiling on key set fetches per minute.
    pub max_fetches_per_minute: u32,
}

impl ValidatorConfig {
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        jwks_url: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            jwks_url: jwks_url.into(),
            cache_ttl: Duration::from_secs(600),
            max_fetches_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

/// The claims the gateway cares about. Everything else rides along in the
/// raw claim set forwarded downstream.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    iss: String,
    exp: i64,
    token_use: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    aud: Option<serde_json::Value>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, rename = "cognito:username")]
    cognito_username: Option<String>,
    #[serde(default, rename = "cognito:groups")]
    groups: Vec<String>,
}

/// JWT validator with a per-kid key cache and rate-limited key discovery.
pub struct TokenValidator {
    config: ValidatorConfig,
    http: reqwest::Client,
    keys: DashMap<String, CachedKey>,
    fetch_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl TokenValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        let per_minute =
            NonZeroU32::new(config.max_fetches_per_minute).unwrap_or(nonzero!(10u32));
        Self {
            config,
            http: reqwest::Client::new(),
            keys: DashMap::new(),
            fetch_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Verify a raw JWT and return the decoded identity.
    pub async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::MalformedToken(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::MalformedToken("missing kid".to_string()))?;

        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        // expired means expired; no grace window on the boundary
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        validation.set_issuer(&[&self.config.issuer]);
        // the audience rules depend on token kind, checked manually in
        // check_client below
        validation.validate_aud = false;

        let data = decode::<serde_json::Value>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
                ErrorKind::InvalidIssuer => {
                    AuthError::ClaimMismatch("issuer mismatch".to_string())
                }
                ErrorKind::InvalidAudience => {
                    AuthError::ClaimMismatch("audience does not match".to_string())
                }
                _ => AuthError::MalformedToken(e.to_string()),
            }
        })?;

        let raw: RawClaims = serde_json::from_value(data.claims.clone())
            .map_err(|e| AuthError::MalformedToken(format!("claim shape: {e}")))?;

        self.check_client(&raw)?;
        let token_use = match raw.token_use.as_deref() {
            Some("access") => TokenUse::Access,
            Some("id") => TokenUse::Id,
            other => {
                return Err(AuthError::ClaimMismatch(format!(
                    "unrecognized token_use {other:?}"
                )))
            }
        };
        let handle = match token_use {
            TokenUse::Access => raw.username.clone(),
            TokenUse::Id => raw.cognito_username.clone(),
        }
        .unwrap_or_else(|| raw.sub.clone());

        debug!(sub = %raw.sub, token_use = ?token_use, "Token validated");

        Ok(Identity {
            subject: raw.sub,
            handle,
            token_use,
            expires_at: raw.exp,
            issuer: raw.iss,
            groups: raw.groups,
            claims: data.claims,
        })
    }

    /// The kind-appropriate client check: access tokens name the client in
    /// `client_id`, id tokens in `aud` (a string or an array of strings).
    fn check_client(&self, raw: &RawClaims) -> Result<(), AuthError> {
        match raw.token_use.as_deref() {
            Some("access") => match raw.client_id.as_deref() {
                Some(id) if id == self.config.client_id => Ok(()),
                _ => Err(AuthError::ClaimMismatch(
                    "client_id does not match".to_string(),
                )),
            },
            Some("id") => {
                let matches = match &raw.aud {
                    Some(serde_json::Value::String(aud)) => aud == &self.config.client_id,
                    Some(serde_json::Value::Array(auds)) => auds
                        .iter()
                        .any(|a| a.as_str() == Some(self.config.client_id.as_str())),
                    _ => false,
                };
                if matches {
                    Ok(())
                } else {
                    Err(AuthError::ClaimMismatch("audience does not match".to_string()))
                }
            }
            _ => Ok(()),
        }
    }

    /// Resolve the decoding key for a key id: fresh cache hit, else a
    /// rate-limited key set fetch, else a stale cached key as fallback.
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(cached) = self.keys.get(kid) {
            if cached.fetched_at.elapsed() < self.config.cache_ttl {
                return Ok(cached.key.clone());
            }
        }

        if self.fetch_limiter.check().is_err() {
            if let Some(cached) = self.keys.get(kid) {
                warn!(kid = %kid, "Key refresh rate limited, using stale cached key");
                return Ok(cached.key.clone());
            }
            return Err(AuthError::KeyDiscovery(
                "key set fetch rate limit exceeded".to_string(),
            ));
        }

        self.refresh_keys().await?;

        match self.keys.get(kid) {
            Some(cached) => Ok(cached.key.clone()),
            None => Err(AuthError::UnknownKey(kid.to_string())),
        }
    }

    /// Fetch the published key set and cache every RSA key in it.
    async fn refresh_keys(&self) -> Result<(), AuthError> {
        debug!(url = %self.config.jwks_url, "Fetching key set");

        let response = self
            .http
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyDiscovery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::KeyDiscovery(format!(
                "key set endpoint returned {}",
                response.status()
            )));
        }

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| AuthError::KeyDiscovery(format!("invalid key set body: {e}")))?;

        let fetched_at = Instant::now();
        let mut published = std::collections::HashSet::new();
        for jwk in &jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (&jwk.kid, &jwk.n, &jwk.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => {
                    self.keys.insert(kid.clone(), CachedKey { key, fetched_at });
                    published.insert(kid.clone());
                }
                Err(err) => {
                    warn!(kid = %kid, error = %err, "Skipping unusable published key");
                }
            }
        }

        // keys the provider rotated out must stop verifying tokens
        self.keys.retain(|kid, _| published.contains(kid));

        info!(keys_cached = published.len(), "Key set refreshed");
        Ok(())
    }

    /// Drop all cached keys. The next validation fetches a fresh key set.
    pub fn reset_cache(&self) {
        self.keys.clear();
    }
}
