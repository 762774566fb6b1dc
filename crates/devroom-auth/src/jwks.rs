//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! Keys are fetched from the identity provider's JWKS endpoint and kept in
//! memory until the refresh interval elapses or an unknown `kid` shows up.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use base64::prelude::*;
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{AuthError, Result};

/// JWKS response from the identity provider.
#[derive(Debug, Deserialize)]
pub struct JwksResponse {
    /// The list of keys.
    pub keys: Vec<JwkKey>,
}

/// A single JWK (JSON Web Key).
#[derive(Debug, Deserialize)]
pub struct JwkKey {
    /// Key type (`OKP` or `RSA`).
    pub kty: String,
    /// Curve for OKP keys (e.g. `Ed25519`).
    pub crv: Option<String>,
    /// OKP public key (base64url).
    pub x: Option<String>,
    /// RSA modulus (base64url).
    pub n: Option<String>,
    /// RSA exponent (base64url).
    pub e: Option<String>,
    /// Key ID.
    pub kid: Option<String>,
    /// Key use (e.g. `sig`).
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// Algorithm (e.g. `EdDSA`, `RS256`).
    pub alg: Option<String>,
}

/// A decoded key together with the only algorithm it may verify.
#[derive(Clone)]
pub struct VerificationKey {
    /// The decoding key.
    pub key: DecodingKey,
    /// The algorithm pinned to this key.
    pub algorithm: Algorithm,
}

/// Cached JWKS keys with expiration.
struct CachedKeys {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Option<Instant>,
}

/// JWKS key provider that fetches and caches keys.
pub struct JwksProvider {
    url: String,
    refresh_interval: Duration,
    client: reqwest::Client,
    cache: RwLock<CachedKeys>,
}

impl JwksProvider {
    /// Create a new JWKS provider for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the HTTP client cannot be created.
    pub fn new(url: impl Into<String>, refresh_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            refresh_interval,
            client,
            cache: RwLock::new(CachedKeys {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        })
    }

    /// Get a verification key by key ID, fetching from JWKS if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not found or the JWKS fetch fails.
    pub async fn get_key(&self, kid: &str) -> Result<VerificationKey> {
        // Check cache first
        {
            let cache = self.cache.read();
            let fresh = cache
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.refresh_interval);
            if fresh {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        // Refresh keys
        self.refresh_keys().await?;

        // Try again
        let cache = self.cache.read();
        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::KeyNotFound(kid.to_string()))
    }

    /// Refresh the JWKS cache by fetching from the server.
    async fn refresh_keys(&self) -> Result<()> {
        tracing::debug!(url = %self.url, "Fetching JWKS");

        let response: JwksResponse = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::JwksFetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchFailed(e.to_string()))?;

        let mut new_keys = HashMap::new();

        for key in response.keys {
            if let Some(kid) = &key.kid {
                match Self::parse_key(&key) {
                    Ok(Some(parsed)) => {
                        new_keys.insert(kid.clone(), parsed);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(kid = %kid, error = %e, "Ignoring malformed JWK"),
                }
            }
        }

        tracing::debug!(count = new_keys.len(), "Cached JWKS keys");

        let mut cache = self.cache.write();
        cache.keys = new_keys;
        cache.fetched_at = Some(Instant::now());

        Ok(())
    }

    /// Parse a JWK into a `VerificationKey`.
    fn parse_key(key: &JwkKey) -> Result<Option<VerificationKey>> {
        if key.key_use.as_deref().is_some_and(|u| u != "sig") {
            return Ok(None);
        }

        match key.kty.as_str() {
            "OKP" => {
                let crv = key.crv.as_deref().unwrap_or("");
                if crv != "Ed25519" {
                    tracing::warn!(crv = crv, "Unsupported OKP curve");
                    return Ok(None);
                }

                let x = key
                    .x
                    .as_ref()
                    .ok_or_else(|| AuthError::InvalidToken("missing x parameter".to_string()))?;

                let public_key = BASE64_URL_SAFE_NO_PAD
                    .decode(x)
                    .map_err(|e| AuthError::InvalidToken(format!("invalid base64: {e}")))?;

                Ok(Some(VerificationKey {
                    key: DecodingKey::from_ed_der(&public_key),
                    algorithm: Algorithm::EdDSA,
                }))
            }
            "RSA" => {
                let (Some(n), Some(e)) = (key.n.as_deref(), key.e.as_deref()) else {
                    return Err(AuthError::InvalidToken("missing RSA components".to_string()));
                };

                let algorithm = match key.alg.as_deref() {
                    None => Algorithm::RS256,
                    Some(alg) => Algorithm::from_str(alg)
                        .map_err(|_| AuthError::UnsupportedAlgorithm(alg.to_string()))?,
                };
                if !matches!(
                    algorithm,
                    Algorithm::RS256
                        | Algorithm::RS384
                        | Algorithm::RS512
                        | Algorithm::PS256
                        | Algorithm::PS384
                        | Algorithm::PS512
                ) {
                    return Err(AuthError::UnsupportedAlgorithm(format!("{algorithm:?}")));
                }

                let decoding = DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
                Ok(Some(VerificationKey {
                    key: decoding,
                    algorithm,
                }))
            }
            other => {
                tracing::warn!(kty = other, "Unknown key type");
                Ok(None)
            }
        }
    }

    /// Force a refresh of the JWKS cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWKS fetch fails.
    pub async fn force_refresh(&self) -> Result<()> {
        self.refresh_keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ED25519_X: &str = "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo";

    fn okp_key(kid: &str) -> JwkKey {
        JwkKey {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            x: Some(ED25519_X.to_string()),
            n: None,
            e: None,
            kid: Some(kid.to_string()),
            key_use: Some("sig".to_string()),
            alg: Some("EdDSA".to_string()),
        }
    }

    #[test]
    fn parse_ed25519_key() {
        let result = JwksProvider::parse_key(&okp_key("test-key")).unwrap().unwrap();
        assert_eq!(result.algorithm, Algorithm::EdDSA);
    }

    #[test]
    fn skip_unsupported_curve() {
        let mut key = okp_key("test-key");
        key.crv = Some("X25519".to_string());

        let result = JwksProvider::parse_key(&key).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn skip_encryption_keys() {
        let mut key = okp_key("test-key");
        key.key_use = Some("enc".to_string());
        assert!(JwksProvider::parse_key(&key).unwrap().is_none());
    }

    #[test]
    fn rsa_key_requires_components() {
        let key = JwkKey {
            kty: "RSA".to_string(),
            crv: None,
            x: None,
            n: None,
            e: Some("AQAB".to_string()),
            kid: Some("rsa".to_string()),
            key_use: None,
            alg: Some("RS256".to_string()),
        };
        assert!(JwksProvider::parse_key(&key).is_err());
    }

    #[tokio::test]
    async fn fetches_once_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "keys": [{
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "x": ED25519_X,
                    "kid": "k1",
                    "use": "sig",
                    "alg": "EdDSA"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = JwksProvider::new(
            format!("{}/.well-known/jwks.json", server.uri()),
            Duration::from_secs(300),
        )
        .unwrap();

        assert_eq!(provider.get_key("k1").await.unwrap().algorithm, Algorithm::EdDSA);
        assert_eq!(provider.get_key("k1").await.unwrap().algorithm, Algorithm::EdDSA);
    }

    #[tokio::test]
    async fn unknown_kid_is_key_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })))
            .mount(&server)
            .await;

        let provider = JwksProvider::new(server.uri(), Duration::from_secs(300)).unwrap();
        let result = provider.get_key("missing").await;
        assert!(matches!(result, Err(AuthError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn server_error_is_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = JwksProvider::new(server.uri(), Duration::from_secs(300)).unwrap();
        let result = provider.get_key("k1").await;
        assert!(matches!(result, Err(AuthError::JwksFetchFailed(_))));
    }
}
