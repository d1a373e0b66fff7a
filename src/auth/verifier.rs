use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::config::AppConfig;

/// Identity claims extracted from a verified session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// Coarse failure reasons. These are safe to return to callers; they never
/// echo token contents or key material.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("unknown signing key")]
    UnknownKey,
    #[error("token rejected")]
    Invalid,
    #[error("signing keys unavailable")]
    KeysUnavailable,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

enum KeySource {
    /// Remote key set, fetched lazily and cached. The refresh mutex makes
    /// concurrent cache misses collapse into a single fetch.
    Jwks {
        url: String,
        http: reqwest::Client,
        cached: RwLock<Option<JwkSet>>,
        refresh: Mutex<()>,
    },
    /// HS256 shared secret for development and tests.
    Secret(DecodingKey),
}

pub struct TokenVerifier {
    source: KeySource,
    issuer: Option<String>,
    audience: Option<String>,
}

impl TokenVerifier {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let source = if let Some(url) = &config.auth_jwks_url {
            KeySource::Jwks {
                url: url.clone(),
                http: reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(5))
                    .build()?,
                cached: RwLock::new(None),
                refresh: Mutex::new(()),
            }
        } else {
            let secret = config
                .auth_shared_secret
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no token verification key configured"))?;
            KeySource::Secret(DecodingKey::from_secret(secret.as_bytes()))
        };

        Ok(Self {
            source,
            issuer: config.auth_issuer.clone(),
            audience: config.auth_audience.clone(),
        })
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;

        let (key, algorithm) = match &self.source {
            KeySource::Secret(key) => (key.clone(), Algorithm::HS256),
            KeySource::Jwks { .. } => {
                let kid = header.kid.as_deref().ok_or(AuthError::Malformed)?;
                self.decoding_key_for(kid).await?
            }
        };

        let mut validation = Validation::new(algorithm);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience.clone()]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer.clone()]);
        }

        let data =
            decode::<RawClaims>(token, &key, &validation).map_err(|_| AuthError::Invalid)?;

        Ok(VerifiedClaims {
            subject: data.claims.sub,
            email: data.claims.email,
            name: data.claims.name,
            picture: data.claims.picture,
        })
    }

    async fn decoding_key_for(&self, kid: &str) -> Result<(DecodingKey, Algorithm), AuthError> {
        let KeySource::Jwks {
            url,
            http,
            cached,
            refresh,
        } = &self.source
        else {
            return Err(AuthError::KeysUnavailable);
        };

        if let Some(found) = Self::lookup(&*cached.read().await, kid) {
            return Ok(found);
        }

        // Unknown kid: refresh the set once. Whoever loses the race for the
        // guard re-checks the cache before fetching again.
        let _guard = refresh.lock().await;
        if let Some(found) = Self::lookup(&*cached.read().await, kid) {
            return Ok(found);
        }

        let fresh: JwkSet = http
            .get(url)
            .send()
            .await
            .map_err(|_| AuthError::KeysUnavailable)?
            .json()
            .await
            .map_err(|_| AuthError::KeysUnavailable)?;

        let mut slot = cached.write().await;
        *slot = Some(fresh);
        Self::lookup(&slot, kid).ok_or(AuthError::UnknownKey)
    }

    fn lookup(set: &Option<JwkSet>, kid: &str) -> Option<(DecodingKey, Algorithm)> {
        let set = set.as_ref()?;
        let jwk = set.find(kid)?;
        let AlgorithmParameters::RSA(_) = &jwk.algorithm else {
            return None;
        };
        let key = DecodingKey::from_jwk(jwk).ok()?;
        Some((key, Algorithm::RS256))
    }
}
