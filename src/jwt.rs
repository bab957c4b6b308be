//! Bearer token verification against the identity provider's JWKS.
//!
//! Only RS256 is accepted; the signing keys are fetched from the published
//! JWKS endpoint, cached with a TTL, and refreshed once when a token names a
//! kid we have not seen. Callers get an opaque failure: the HTTP surface maps
//! every `AuthError` to `AUTHENTICATION_FAILED` without detail.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons stay internal; the wire response never carries them.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer credentials")]
    MissingBearer,
    #[error("malformed authorization header")]
    MalformedHeader,
    #[error("token rejected: {0}")]
    Rejected(&'static str),
    #[error("signing key fetch failed")]
    KeyFetch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
    #[serde(default)]
    pub iss: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// Exactly one space, a single credential: comma-separated credential lists
/// and multi-space variants are rejected rather than best-effort parsed.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingBearer)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = raw.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    if scheme != "Bearer"
        || token.is_empty()
        || token.contains(' ')
        || token.contains(',')
    {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    keys: HashMap<String, (String, String)>,
    fetched_at: Instant,
}

pub struct JwksVerifier {
    http: reqwest::Client,
    jwks_url: Url,
    issuer: String,
    audience: String,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksVerifier {
    pub fn new(jwks_url: Url, issuer: String, audience: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            jwks_url,
            issuer,
            audience,
            cache: RwLock::new(None),
        })
    }

    async fn key_components(&self, kid: &str) -> Result<(String, String), AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    if let Some(components) = cached.keys.get(kid) {
                        return Ok(components.clone());
                    }
                }
            }
        }

        // Cache miss or unknown kid: refresh once and retry the lookup.
        let fetched = self.fetch_jwks().await?;
        let mut cache = self.cache.write().await;
        *cache = Some(CachedKeys {
            keys: fetched,
            fetched_at: Instant::now(),
        });
        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or(AuthError::Rejected("unknown signing key"))
    }

    async fn fetch_jwks(&self) -> Result<HashMap<String, (String, String)>, AuthError> {
        let response = self
            .http
            .get(self.jwks_url.clone())
            .send()
            .await
            .map_err(|e| {
                warn!("JWKS fetch failed: {e}");
                AuthError::KeyFetch
            })?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "JWKS endpoint returned non-success");
            return Err(AuthError::KeyFetch);
        }
        let set: JwkSet = response.json().await.map_err(|e| {
            warn!("JWKS body was not parseable: {e}");
            AuthError::KeyFetch
        })?;

        let mut keys = HashMap::new();
        for jwk in set.keys {
            if let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) {
                keys.insert(kid, (n, e));
            }
        }
        debug!(count = keys.len(), "refreshed JWKS cache");
        Ok(keys)
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header =
            decode_header(token).map_err(|_| AuthError::Rejected("undecodable header"))?;

        // The allow-list is RS256 alone. `none` never reaches here because
        // jsonwebtoken has no such algorithm, but an explicit check keeps the
        // contract visible.
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::Rejected("algorithm not allowed"));
        }
        let kid = header.kid.ok_or(AuthError::Rejected("missing kid"))?;

        let (n, e) = self.key_components(&kid).await?;
        let key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|_| AuthError::Rejected("invalid signing key"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|_| AuthError::Rejected("signature or claims invalid"))?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Rejected("empty subject"));
        }
        Ok(data.claims)
    }
}

impl std::fmt::Debug for JwksVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksVerifier")
            .field("jwks_url", &self.jwks_url.as_str())
            .field("issuer", &self.issuer)
            .finish()
    }
}
